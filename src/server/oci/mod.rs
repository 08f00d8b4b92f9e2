pub mod reference;
pub mod route;

pub use reference::{ImageReference, ReferenceError};
pub use route::{ImageEndpoint, ImagePath, V2Route};
