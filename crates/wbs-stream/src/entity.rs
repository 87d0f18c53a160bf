//! Entity trait definition for type-safe write-behind streams.

use serde::{de::DeserializeOwned, Serialize};

/// Trait for types whose mutations are logged to a write-behind stream.
///
/// The entity type tag is lowercased into the stream key, the dead-letter
/// key and every consumer name derived for the entity. Payloads are
/// carried as JSON in the entry's `content` field.
///
/// # Example
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use wbs_stream::Entity;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// pub struct Employer {
///     pub id: i64,
///     pub email: String,
/// }
///
/// impl Entity for Employer {
///     const ENTITY_TYPE: &'static str = "Employer";
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The entity type name.
    ///
    /// Two entity types must never share a name: they would write to the same
    /// stream.
    const ENTITY_TYPE: &'static str;
}
