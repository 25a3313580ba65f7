mod api_error;
mod campaigns;
mod compose;
mod health_check;
mod templates;

pub use api_error::*;
pub use campaigns::*;
pub use compose::*;
pub use health_check::*;
pub use templates::*;
