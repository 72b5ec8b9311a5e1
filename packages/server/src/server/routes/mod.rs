// HTTP routes
pub mod admin;
pub mod analyse;
pub mod health;
pub mod results;

pub use admin::*;
pub use analyse::*;
pub use health::*;
pub use results::*;
