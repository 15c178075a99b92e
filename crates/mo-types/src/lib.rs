pub mod errors;
pub mod record;
pub mod schema;

pub use errors::*;
pub use record::*;
pub use schema::*;
