mod types;
mod value;

pub use types::{microsoft, AttributeType};
pub use value::AttributeValue;
