pub mod conditions;
pub mod dumprequest;

pub use conditions::*;
pub use dumprequest::*;
