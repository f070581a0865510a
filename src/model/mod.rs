pub mod instance;
pub mod query;
pub mod schema;
pub mod value;

pub use instance::{Instance, InstanceRef, InstanceView, Slot};
pub use query::{AttributeQuery, Operator, QueryRequest, QueryValue};
pub use schema::{
    AttributeDefinition, ClassDefinition, DefiningType, Direction, InstanceKind, Schema,
    SchemaAttribute, SchemaClass, SchemaDefinition, ValueKind, DB_ID, DISPLAY_NAME, SCHEMA_CLASS,
    TIMESTAMP,
};
pub use value::AttributeValue;
