//! 工具层：注册表、权限、带超时与审计的执行器

pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{
    Permission, Permissions, RegistrationError, Tool, ToolError, ToolInvoker, ToolOutput,
    ToolRegistry,
};
