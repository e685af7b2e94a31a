//! Built-in cleanup providers

mod rest;

pub use rest::RestProvider;

use crate::provider::CleanupProvider;

/// Built-in provider for `name`, unconfigured. `None` means the name refers
/// to a custom provider backed only by handler files.
pub fn builtin(name: &str) -> Option<Box<dyn CleanupProvider>> {
    match name {
        "http" => Some(Box::new(RestProvider::http())),
        "appwrite" => Some(Box::new(RestProvider::appwrite())),
        _ => None,
    }
}
