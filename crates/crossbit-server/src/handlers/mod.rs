pub mod calculator;
pub mod echo;
pub mod fixtures;
pub mod sleeper;

use crossbit::{Fault, HandlerContext, LibType, Library};

/// Bind the library named by the `lib` kwarg, or this executable.
pub(crate) fn bind_default(ctx: &HandlerContext) -> Result<Library, Fault> {
    match ctx.kwarg("lib") {
        Some(path) if !path.is_empty() => Library::bind(ctx, path, LibType::Cdll),
        _ => Library::bind(ctx, std::env::current_exe()?, LibType::Cdll),
    }
}
