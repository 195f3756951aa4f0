pub mod audit;
pub mod catalog;
pub mod compose;
pub mod config;
pub mod db;
pub mod error;
pub mod facts;
pub mod fetch;
pub mod join;
pub mod pipeline;
pub mod query;
pub mod reasoning;

#[cfg(test)]
mod fixtures;

pub use audit::{AuditLog, AuditRecord};
pub use catalog::{SchemaCatalog, SchemaError, SemanticType};
pub use compose::{QueryTrace, ReportBundle, TopicGroup};
pub use config::ReportConfig;
pub use error::ReportError;
pub use facts::{Confidence, Fact, FactSet, Provenance};
pub use fetch::{DatabaseConnector, FetchError, PgConnector, RawRow};
pub use join::{JoinEdge, JoinPath};
pub use pipeline::{EngineSettings, ParsedIntent, ReportEngine};
pub use query::{FilterPredicate, FilterValue, ParamValue, ParameterizedQuery, TimeWindow, UnsafeQueryError};
pub use reasoning::{
    OpenAiReasoningClient, ReasoningBackend, ReasoningClientConfig, ReasoningCompletion, ReasoningError,
    ReasoningRequest,
};
