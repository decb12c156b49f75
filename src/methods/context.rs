use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::SqlConnection;
use crate::core::{Result, Row, Value};
use crate::records;
use crate::registry::{ModelRegistry, RuntimeModel};

/// Who is calling a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    Anonymous,
    User { id: String, superuser: bool },
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User {
            id: id.into(),
            superuser: false,
        }
    }

    pub fn superuser(id: impl Into<String>) -> Self {
        Self::User {
            id: id.into(),
            superuser: true,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::User { id, .. } => Some(id),
            Self::Anonymous => None,
        }
    }

    pub fn is_superuser(&self) -> bool {
        matches!(self, Self::User { superuser: true, .. })
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::User { id, .. } => f.write_str(id),
        }
    }
}

/// Arguments passed to a method call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodArgs {
    pub positional: Vec<Value>,
    pub named: BTreeMap<String, Value>,
}

impl MethodArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// Named argument `name`, else the first positional one.
    pub fn value_for(&self, name: &str) -> Option<&Value> {
        self.named.get(name).or_else(|| self.positional.first())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "args": self.positional.iter().map(Value::to_json).collect::<Vec<_>>(),
            "kwargs": self
                .named
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect::<serde_json::Map<_, _>>(),
        })
    }
}

/// What a method implementation sees: the instance it runs on, the caller,
/// and a connection inside the call's transaction.
pub struct MethodContext<'a> {
    pub(crate) conn: &'a mut dyn SqlConnection,
    pub(crate) registry: &'a ModelRegistry,
    pub(crate) model: Arc<RuntimeModel>,
    pub(crate) instance_id: i64,
    pub(crate) caller: &'a Caller,
}

impl<'a> MethodContext<'a> {
    pub fn model(&self) -> &RuntimeModel {
        &self.model
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn caller(&self) -> &Caller {
        self.caller
    }

    pub fn registry(&self) -> &ModelRegistry {
        self.registry
    }

    pub fn connection(&mut self) -> &mut dyn SqlConnection {
        &mut *self.conn
    }

    /// Current row of the instance.
    pub fn instance(&mut self) -> Result<Row> {
        records::fetch(&mut *self.conn, &self.model, self.instance_id)
    }
}
