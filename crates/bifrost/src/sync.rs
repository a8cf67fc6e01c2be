//! Variable exchange across the process boundary.
//!
//! The bridge only depends on the [`VariableSync`] trait: push a named set
//! before a run, pull a named set after it. Values carry an explicit
//! [`TypeTag`]; a [`SerializerRegistry`] maps tags to encode/decode functions
//! and falls back to JSON pass-through for anything unregistered.
//!
//! [`JsonFileSync`] is the bundled implementation: one directory per shared
//! segment holding `in.json` (host → companion) and `out.json`
//! (companion → host).

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Environment variable overriding the root directory of file-backed segments.
pub const ENV_SYNC_ROOT: &str = "BIFROST_SYNC_ROOT";

/// Encoding name of the default pass-through (de)serializer.
pub const DEFAULT_ENCODING: &str = "json";

const INBOUND_FILE: &str = "in.json";
const OUTBOUND_FILE: &str = "out.json";

/// Explicit type identifier attached to every variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(Cow<'static, str>);

impl TypeTag {
    pub const NULL: TypeTag = TypeTag(Cow::Borrowed("null"));
    pub const BOOL: TypeTag = TypeTag(Cow::Borrowed("bool"));
    pub const INT: TypeTag = TypeTag(Cow::Borrowed("int"));
    pub const FLOAT: TypeTag = TypeTag(Cow::Borrowed("float"));
    pub const STR: TypeTag = TypeTag(Cow::Borrowed("str"));
    pub const LIST: TypeTag = TypeTag(Cow::Borrowed("list"));
    pub const DICT: TypeTag = TypeTag(Cow::Borrowed("dict"));

    pub fn new(tag: impl Into<String>) -> Self {
        Self(Cow::Owned(tag.into()))
    }

    /// Builtin tag for a plain JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::NULL,
            Value::Bool(_) => Self::BOOL,
            Value::Number(n) if n.is_f64() => Self::FLOAT,
            Value::Number(_) => Self::INT,
            Value::String(_) => Self::STR,
            Value::Array(_) => Self::LIST,
            Value::Object(_) => Self::DICT,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named value as seen by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub tag: TypeTag,
    pub value: Value,
}

impl Variable {
    /// Variable tagged with the builtin tag of its JSON shape.
    pub fn new(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            tag: TypeTag::of(&value),
            value,
        }
    }

    /// Variable with a caller-chosen tag, for types with custom (de)serializers.
    pub fn tagged(tag: TypeTag, value: impl Into<Value>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }
}

impl From<Value> for Variable {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

pub type VariableSet = BTreeMap<String, Variable>;

/// Transport form of a variable, as stored in the shared segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedVariable {
    pub tag: TypeTag,
    pub encoding: String,
    pub data: Value,
}

pub type SerializeFn = Arc<dyn Fn(&Variable) -> Result<EncodedVariable, String> + Send + Sync>;
pub type DeserializeFn = Arc<dyn Fn(EncodedVariable) -> Result<Variable, String> + Send + Sync>;

/// Per-tag outbound encoders and inbound decoders.
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    serializers: HashMap<TypeTag, SerializeFn>,
    deserializers: HashMap<TypeTag, DeserializeFn>,
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("serializers", &self.serializers.keys().collect::<Vec<_>>())
            .field("deserializers", &self.deserializers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_serializer<F>(&mut self, tag: TypeTag, f: F)
    where
        F: Fn(&Variable) -> Result<EncodedVariable, String> + Send + Sync + 'static,
    {
        self.serializers.insert(tag, Arc::new(f));
    }

    pub fn register_deserializer<F>(&mut self, tag: TypeTag, f: F)
    where
        F: Fn(EncodedVariable) -> Result<Variable, String> + Send + Sync + 'static,
    {
        self.deserializers.insert(tag, Arc::new(f));
    }

    pub fn encode(&self, variable: &Variable) -> Result<EncodedVariable, String> {
        match self.serializers.get(&variable.tag) {
            Some(serialize) => serialize(variable),
            None => Ok(EncodedVariable {
                tag: variable.tag.clone(),
                encoding: DEFAULT_ENCODING.to_string(),
                data: variable.value.clone(),
            }),
        }
    }

    pub fn decode(&self, encoded: EncodedVariable) -> Result<Variable, String> {
        if let Some(deserialize) = self.deserializers.get(&encoded.tag) {
            return deserialize(encoded);
        }
        if encoded.encoding != DEFAULT_ENCODING {
            return Err(format!(
                "no deserializer registered for {} encoded as {}",
                encoded.tag, encoded.encoding
            ));
        }
        Ok(Variable {
            tag: encoded.tag,
            value: encoded.data,
        })
    }

    /// Encode every variable. In warn mode failures are logged and skipped;
    /// otherwise all failures are collected into one error.
    pub fn encode_set(
        &self,
        variables: &VariableSet,
        warn: bool,
    ) -> Result<BTreeMap<String, EncodedVariable>, SyncError> {
        let mut encoded = BTreeMap::new();
        let mut failures = Vec::new();
        for (name, variable) in variables {
            match self.encode(variable) {
                Ok(e) => {
                    encoded.insert(name.clone(), e);
                }
                Err(message) => failures.push(VariableError {
                    name: name.clone(),
                    tag: variable.tag.clone(),
                    message,
                }),
            }
        }
        settle(encoded, failures, warn, "push")
    }

    /// Decode every variable with the same failure policy as [`Self::encode_set`].
    pub fn decode_set(
        &self,
        encoded: BTreeMap<String, EncodedVariable>,
        warn: bool,
    ) -> Result<VariableSet, SyncError> {
        let mut variables = VariableSet::new();
        let mut failures = Vec::new();
        for (name, e) in encoded {
            let tag = e.tag.clone();
            match self.decode(e) {
                Ok(v) => {
                    variables.insert(name, v);
                }
                Err(message) => failures.push(VariableError { name, tag, message }),
            }
        }
        settle(variables, failures, warn, "pull")
    }
}

fn settle<T>(
    value: T,
    failures: Vec<VariableError>,
    warn: bool,
    direction: &str,
) -> Result<T, SyncError> {
    if failures.is_empty() {
        return Ok(value);
    }
    if warn {
        for failure in &failures {
            tracing::warn!(
                direction,
                variable = %failure.name,
                tag = %failure.tag,
                error = %failure.message,
                "Skipping variable that failed to sync"
            );
        }
        return Ok(value);
    }
    Err(SyncError::Variables(failures))
}

/// One variable that could not be (de)serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableError {
    pub name: String,
    pub tag: TypeTag,
    pub message: String,
}

impl fmt::Display for VariableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.tag, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{} variable(s) failed to sync: {}", .0.len(), join_failures(.0))]
    Variables(Vec<VariableError>),

    #[error("variable store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("variable store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn join_failures(failures: &[VariableError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Moves variables between host and companion.
#[async_trait]
pub trait VariableSync: Send + Sync {
    /// Publish `variables` for the companion, encoding each with `serializers`.
    async fn push(
        &self,
        variables: &VariableSet,
        serializers: &SerializerRegistry,
        warn: bool,
    ) -> Result<(), SyncError>;

    /// Collect the variables the companion returned, decoding each with `deserializers`.
    async fn pull(
        &self,
        deserializers: &SerializerRegistry,
        warn: bool,
    ) -> Result<VariableSet, SyncError>;
}

/// File-backed segment: `<root>/<segment>/{in,out}.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSync {
    dir: PathBuf,
}

impl JsonFileSync {
    pub fn new(root: impl AsRef<Path>, segment: &str) -> Self {
        Self {
            dir: root.as_ref().join(segment),
        }
    }

    /// Segment under `BIFROST_SYNC_ROOT`, or the system temp dir.
    pub fn from_env(segment: &str) -> Self {
        let root = std::env::var_os(ENV_SYNC_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self::new(root, segment)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn inbound_path(&self) -> PathBuf {
        self.dir.join(INBOUND_FILE)
    }

    pub fn outbound_path(&self) -> PathBuf {
        self.dir.join(OUTBOUND_FILE)
    }

    /// Read what the host pushed (companion side).
    pub async fn read_inbound(&self) -> Result<BTreeMap<String, EncodedVariable>, SyncError> {
        read_records(&self.inbound_path()).await
    }

    /// Publish variables for the host to pull (companion side).
    pub async fn write_outbound(
        &self,
        records: &BTreeMap<String, EncodedVariable>,
    ) -> Result<(), SyncError> {
        write_records(&self.dir, &self.outbound_path(), records).await
    }

    /// Remove the segment directory. Called once at host shutdown.
    pub fn cleanup(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl VariableSync for JsonFileSync {
    async fn push(
        &self,
        variables: &VariableSet,
        serializers: &SerializerRegistry,
        warn: bool,
    ) -> Result<(), SyncError> {
        let records = serializers.encode_set(variables, warn)?;
        // A leftover out.json belongs to an earlier run.
        remove_if_exists(&self.outbound_path()).await?;
        write_records(&self.dir, &self.inbound_path(), &records).await?;
        tracing::debug!(count = records.len(), dir = %self.dir.display(), "Pushed variables");
        Ok(())
    }

    async fn pull(
        &self,
        deserializers: &SerializerRegistry,
        warn: bool,
    ) -> Result<VariableSet, SyncError> {
        let path = self.outbound_path();
        let records = read_records(&path).await?;
        remove_if_exists(&path).await?;
        tracing::debug!(count = records.len(), dir = %self.dir.display(), "Pulled variables");
        deserializers.decode_set(records, warn)
    }
}

async fn read_records(path: &Path) -> Result<BTreeMap<String, EncodedVariable>, SyncError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

/// Write through a temp file and rename so readers never see a partial file.
async fn write_records(
    dir: &Path,
    path: &Path,
    records: &BTreeMap<String, EncodedVariable>,
) -> Result<(), SyncError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SyncError::io(dir, e))?;
    let json = serde_json::to_vec(records)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|e| SyncError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SyncError::io(path, e))
}

async fn remove_if_exists(path: &Path) -> Result<(), SyncError> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(SyncError::io(path, e)),
        _ => Ok(()),
    }
}
