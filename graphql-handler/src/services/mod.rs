//! Request and response types of each pipeline stage.

pub mod field;
pub mod operation;
pub mod response;
pub mod transport;

pub use self::field::FieldContext;
pub use self::transport::Extracted;
pub use self::transport::Get;
pub use self::transport::MultipartForm;
pub use self::transport::Options;
pub use self::transport::Post;
pub use self::transport::Upload;
pub use self::transport::Uploads;
