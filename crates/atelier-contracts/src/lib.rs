pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod outpaint;
pub mod records;

pub use config::ServiceConfig;
pub use error::{IndexError, StoreError, ValidationError};
pub use records::{
    ContinuationInfo, ImageRecord, InpaintMode, LineageStore, OperationKind, OperationParams,
};
