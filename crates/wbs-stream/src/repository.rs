//! Repository resolver.
//!
//! Backing stores are registered once per (entity type, repository type)
//! pairing and looked up at runtime by the generic processor. Handles are
//! type-erased over the repository's key type: deletes arrive as raw strings
//! and are converted with [`create_id`] before dispatch.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entity::Entity;
use crate::error::{DispatchError, RepositoryResult, ResolutionError};

/// Declared identifier type of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdType {
    String,
    Uuid,
    Integer,
    Long,
    /// Any other key type, built from its string form.
    Custom(&'static str),
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "String"),
            Self::Uuid => write!(f, "Uuid"),
            Self::Integer => write!(f, "Integer"),
            Self::Long => write!(f, "Long"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// A converted identifier, ready to be handed to a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    String(String),
    Uuid(Uuid),
    Integer(i32),
    Long(i64),
    Custom { id_type: &'static str, value: String },
}

impl EntityKey {
    /// The identifier type this key was built for.
    #[must_use]
    pub fn id_type(&self) -> IdType {
        match self {
            Self::String(_) => IdType::String,
            Self::Uuid(_) => IdType::Uuid,
            Self::Integer(_) => IdType::Integer,
            Self::Long(_) => IdType::Long,
            Self::Custom { id_type, .. } => IdType::Custom(*id_type),
        }
    }

    /// Build a custom key type from its string form.
    ///
    /// This is the single string-argument construction attempt for key types
    /// that are not one of the built-in variants.
    pub fn parse_custom<T>(self, expected: IdType) -> Result<T, ResolutionError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self {
            Self::Custom { id_type, value } if IdType::Custom(id_type) == expected => {
                value.parse::<T>().map_err(|e| ResolutionError::InvalidId {
                    id_type: expected,
                    value,
                    cause: e.to_string(),
                })
            }
            other => Err(ResolutionError::UnsupportedIdType {
                id_type: other.id_type(),
                expected,
            }),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v}"),
            Self::Uuid(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Custom { value, .. } => write!(f, "{value}"),
        }
    }
}

/// Convert a raw identifier string into the native key for `id_type`.
///
/// Strings pass through; UUIDs, integers and longs are parsed. Custom types
/// keep the string and are constructed by the repository's key type.
pub fn create_id(id_type: IdType, value: &str) -> Result<EntityKey, ResolutionError> {
    if value.trim().is_empty() {
        return Err(ResolutionError::EmptyId);
    }

    let invalid = |cause: String| ResolutionError::InvalidId {
        id_type,
        value: value.to_string(),
        cause,
    };

    match id_type {
        IdType::String => Ok(EntityKey::String(value.to_string())),
        IdType::Uuid => Uuid::parse_str(value)
            .map(EntityKey::Uuid)
            .map_err(|e| invalid(e.to_string())),
        IdType::Integer => value
            .parse::<i32>()
            .map(EntityKey::Integer)
            .map_err(|e| invalid(e.to_string())),
        IdType::Long => value
            .parse::<i64>()
            .map(EntityKey::Long)
            .map_err(|e| invalid(e.to_string())),
        IdType::Custom(name) => Ok(EntityKey::Custom {
            id_type: name,
            value: value.to_string(),
        }),
    }
}

/// Native identifier type of a repository.
pub trait RepositoryId: Sized + Send + Sync + 'static {
    /// The declared identifier type.
    fn id_type() -> IdType;

    /// Unpack a converted key.
    fn from_key(key: EntityKey) -> Result<Self, ResolutionError>;
}

fn mismatch(key: &EntityKey, expected: IdType) -> ResolutionError {
    ResolutionError::UnsupportedIdType {
        id_type: key.id_type(),
        expected,
    }
}

impl RepositoryId for String {
    fn id_type() -> IdType {
        IdType::String
    }

    fn from_key(key: EntityKey) -> Result<Self, ResolutionError> {
        match key {
            EntityKey::String(v) => Ok(v),
            other => Err(mismatch(&other, IdType::String)),
        }
    }
}

impl RepositoryId for Uuid {
    fn id_type() -> IdType {
        IdType::Uuid
    }

    fn from_key(key: EntityKey) -> Result<Self, ResolutionError> {
        match key {
            EntityKey::Uuid(v) => Ok(v),
            other => Err(mismatch(&other, IdType::Uuid)),
        }
    }
}

impl RepositoryId for i32 {
    fn id_type() -> IdType {
        IdType::Integer
    }

    fn from_key(key: EntityKey) -> Result<Self, ResolutionError> {
        match key {
            EntityKey::Integer(v) => Ok(v),
            other => Err(mismatch(&other, IdType::Integer)),
        }
    }
}

impl RepositoryId for i64 {
    fn id_type() -> IdType {
        IdType::Long
    }

    fn from_key(key: EntityKey) -> Result<Self, ResolutionError> {
        match key {
            EntityKey::Long(v) => Ok(v),
            other => Err(mismatch(&other, IdType::Long)),
        }
    }
}

/// A typed backing store for one entity type.
///
/// `save` must overwrite and `delete_by_id` must succeed for absent ids:
/// entries are routinely applied more than once.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync + 'static {
    type Id: RepositoryId;

    /// Insert or overwrite the entity.
    async fn save(&self, entity: &E) -> RepositoryResult<()>;

    /// Remove the entity with this id, if present.
    async fn delete_by_id(&self, id: Self::Id) -> RepositoryResult<()>;
}

/// Type-erased repository capability used by the processor.
#[async_trait]
pub trait RepositoryHandle<E: Entity>: Send + Sync {
    /// Registration name, used in logs and errors.
    fn name(&self) -> &str;

    /// Repository type the handle was registered under.
    fn repository_type(&self) -> &str;

    /// Declared identifier type.
    fn id_type(&self) -> IdType;

    /// Save-like call.
    async fn save(&self, entity: &E) -> RepositoryResult<()>;

    /// Delete-by-id-like call with a converted key.
    async fn delete_by_key(&self, key: EntityKey) -> Result<(), DispatchError>;
}

struct TypedHandle<R> {
    name: String,
    repository_type: String,
    repository: Arc<R>,
}

#[async_trait]
impl<E, R> RepositoryHandle<E> for TypedHandle<R>
where
    E: Entity,
    R: Repository<E>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn repository_type(&self) -> &str {
        &self.repository_type
    }

    fn id_type(&self) -> IdType {
        R::Id::id_type()
    }

    async fn save(&self, entity: &E) -> RepositoryResult<()> {
        self.repository.save(entity).await
    }

    async fn delete_by_key(&self, key: EntityKey) -> Result<(), DispatchError> {
        let id = R::Id::from_key(key)?;
        self.repository.delete_by_id(id).await?;
        Ok(())
    }
}

struct Registration {
    repository_type: String,
    name: String,
    handle: Box<dyn Any + Send + Sync>,
}

/// Runtime registry mapping entity types to their repository handles.
#[derive(Default)]
pub struct RepositoryRegistry {
    registrations: RwLock<HashMap<TypeId, Vec<Registration>>>,
}

impl fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryRegistry").finish_non_exhaustive()
    }
}

impl RepositoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository for entity `E` under `repository_type`.
    ///
    /// Registering the same name twice for the same entity replaces the
    /// earlier handle.
    pub async fn register<E, R>(
        &self,
        repository_type: impl Into<String>,
        name: impl Into<String>,
        repository: Arc<R>,
    ) where
        E: Entity,
        R: Repository<E>,
    {
        let repository_type = repository_type.into();
        let name = name.into();
        let handle: Arc<dyn RepositoryHandle<E>> = Arc::new(TypedHandle {
            name: name.clone(),
            repository_type: repository_type.clone(),
            repository,
        });

        let mut registrations = self.registrations.write().await;
        let entries = registrations.entry(TypeId::of::<E>()).or_default();
        entries.retain(|r| r.name != name);
        entries.push(Registration {
            repository_type: repository_type.clone(),
            name: name.clone(),
            handle: Box::new(handle),
        });

        info!(
            entity_type = E::ENTITY_TYPE,
            repository_type = %repository_type,
            repository = %name,
            "Repository registered"
        );
    }

    /// Handles bound to entity `E` whose repository type matches `repository_type`.
    ///
    /// Matching ignores case. An empty result is not an error.
    pub async fn find_repositories_for_entity<E: Entity>(
        &self,
        repository_type: &str,
    ) -> Vec<Arc<dyn RepositoryHandle<E>>> {
        let registrations = self.registrations.read().await;
        let found: Vec<Arc<dyn RepositoryHandle<E>>> = registrations
            .get(&TypeId::of::<E>())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|r| r.repository_type.eq_ignore_ascii_case(repository_type))
                    .filter_map(|r| r.handle.downcast_ref::<Arc<dyn RepositoryHandle<E>>>())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            entity_type = E::ENTITY_TYPE,
            repository_type = %repository_type,
            count = found.len(),
            "Repositories resolved"
        );
        found
    }

    /// Declared identifier type of a handle.
    #[must_use]
    pub fn id_type<E: Entity>(handle: &dyn RepositoryHandle<E>) -> IdType {
        handle.id_type()
    }

    /// Convert a raw identifier string into the native key for `id_type`.
    pub fn create_id(id_type: IdType, value: &str) -> Result<EntityKey, ResolutionError> {
        create_id(id_type, value)
    }

    /// Untyped save-like call against a resolved handle.
    pub async fn execute_operation<E: Entity>(
        handle: &dyn RepositoryHandle<E>,
        entity: &E,
    ) -> RepositoryResult<()> {
        handle.save(entity).await
    }

    /// Untyped delete-by-id-like call: converts `raw_id` to the handle's key type first.
    pub async fn execute_id_operation<E: Entity>(
        handle: &dyn RepositoryHandle<E>,
        raw_id: &str,
    ) -> Result<(), DispatchError> {
        let key = create_id(handle.id_type(), raw_id)?;
        handle.delete_by_key(key).await
    }

    /// Names of every repository registered for entity `E`.
    pub async fn registered_names<E: Entity>(&self) -> Vec<String> {
        self.registrations
            .read()
            .await
            .get(&TypeId::of::<E>())
            .map(|entries| entries.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }
}

/// Repository holding entities in a map, keyed by an extractor function.
pub struct InMemoryRepository<E, K> {
    key_of: fn(&E) -> K,
    items: RwLock<HashMap<K, E>>,
}

impl<E, K> InMemoryRepository<E, K>
where
    K: Eq + Hash,
{
    /// Create an empty repository.
    #[must_use]
    pub fn new(key_of: fn(&E) -> K) -> Self {
        Self {
            key_of,
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a copy of the entity stored under `id`.
    pub async fn get(&self, id: &K) -> Option<E>
    where
        E: Clone,
    {
        self.items.read().await.get(id).cloned()
    }

    /// Whether an entity is stored under `id`.
    pub async fn contains(&self, id: &K) -> bool {
        self.items.read().await.contains_key(id)
    }

    /// Number of stored entities.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    /// True when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Every stored entity.
    pub async fn all(&self) -> Vec<E>
    where
        E: Clone,
    {
        self.items.read().await.values().cloned().collect()
    }
}

impl<E, K> fmt::Debug for InMemoryRepository<E, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRepository").finish_non_exhaustive()
    }
}

#[async_trait]
impl<E, K> Repository<E> for InMemoryRepository<E, K>
where
    E: Entity + Clone,
    K: RepositoryId + Eq + Hash,
{
    type Id = K;

    async fn save(&self, entity: &E) -> RepositoryResult<()> {
        let key = (self.key_of)(entity);
        self.items.write().await.insert(key, entity.clone());
        Ok(())
    }

    async fn delete_by_id(&self, id: K) -> RepositoryResult<()> {
        self.items.write().await.remove(&id);
        Ok(())
    }
}

type SaveFn<E> = Arc<dyn Fn(E) -> BoxFuture<'static, RepositoryResult<()>> + Send + Sync>;
type DeleteFn<K> = Arc<dyn Fn(K) -> BoxFuture<'static, RepositoryResult<()>> + Send + Sync>;

/// Repository built from a save callback and a delete callback.
pub struct CallbackRepository<E, K> {
    save: SaveFn<E>,
    delete: DeleteFn<K>,
}

impl<E, K> CallbackRepository<E, K> {
    /// Build a repository from the two callbacks.
    pub fn new<S, SF, D, DF>(save: S, delete: D) -> Self
    where
        S: Fn(E) -> SF + Send + Sync + 'static,
        SF: std::future::Future<Output = RepositoryResult<()>> + Send + 'static,
        D: Fn(K) -> DF + Send + Sync + 'static,
        DF: std::future::Future<Output = RepositoryResult<()>> + Send + 'static,
    {
        Self {
            save: Arc::new(move |entity| save(entity).boxed()),
            delete: Arc::new(move |id| delete(id).boxed()),
        }
    }
}

impl<E, K> fmt::Debug for CallbackRepository<E, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRepository").finish_non_exhaustive()
    }
}

#[async_trait]
impl<E, K> Repository<E> for CallbackRepository<E, K>
where
    E: Entity + Clone,
    K: RepositoryId,
{
    type Id = K;

    async fn save(&self, entity: &E) -> RepositoryResult<()> {
        (self.save)(entity.clone()).await
    }

    async fn delete_by_id(&self, id: K) -> RepositoryResult<()> {
        (self.delete)(id).await
    }
}
