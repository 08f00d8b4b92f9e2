pub mod handler;
pub mod hook;
pub mod interceptor;

pub use handler::proxy;
pub use hook::{CommandRunner, HookError, ShellRunner};
pub use interceptor::{Interceptor, MirrorRequest};
