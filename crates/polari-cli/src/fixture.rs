//! JSON fixtures: classes, principals, permission sets, instances and placements.

use crate::error::{CliError, Result};
use polari_core::{
    InMemoryDirectory, InstanceHandle, ObjectStore, ObjectTyping, PermissionSet, StoreConfig,
    Value,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A class declaration.
#[derive(Debug, Deserialize)]
pub struct ClassSpec {
    pub name: String,
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub tree_attachable: bool,
}

fn default_true() -> bool {
    true
}

impl ClassSpec {
    fn to_typing(&self) -> ObjectTyping {
        let mut typing = ObjectTyping::new(self.name.clone());
        if !self.identifiers.is_empty() {
            typing = typing.with_identifier_fields(self.identifiers.iter().cloned());
        }
        for field in &self.fields {
            typing = typing.with_field(field.clone());
        }
        for field in &self.required {
            typing = typing.with_required(field.clone());
        }
        for (field, value) in &self.defaults {
            typing = typing.with_default(field.clone(), Value::from(value.clone()));
        }
        if !self.tree_attachable {
            typing = typing.not_tree_attachable();
        }
        typing
    }
}

/// Known users and groups.
#[derive(Debug, Default, Deserialize)]
pub struct DirectorySpec {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// An instance to create, unplaced.
#[derive(Debug, Deserialize)]
pub struct InstanceSpec {
    pub class: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// `(class, rendered identifiers)` of a fixture instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceKey {
    pub class: String,
    pub id: String,
}

/// An append of `target` to `owner.field`. No owner means the root manager.
#[derive(Debug, Deserialize)]
pub struct PlacementSpec {
    #[serde(default)]
    pub owner: Option<InstanceKey>,
    #[serde(default)]
    pub field: Option<String>,
    pub target: InstanceKey,
}

/// A complete fixture document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub classes: Vec<ClassSpec>,
    pub directory: DirectorySpec,
    pub permission_sets: Vec<PermissionSet>,
    pub instances: Vec<InstanceSpec>,
    pub placements: Vec<PlacementSpec>,
}

impl Fixture {
    /// Read a fixture file.
    pub fn from_path(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Build a store from this fixture.
    pub fn load(self, config: StoreConfig) -> Result<ObjectStore> {
        let mut directory = InMemoryDirectory::new();
        for user in &self.directory.users {
            directory = directory.with_user(user.clone());
        }
        for group in &self.directory.groups {
            directory = directory.with_group(group.clone());
        }
        let store = ObjectStore::new(config)?.with_directory(Arc::new(directory));

        for class in &self.classes {
            store.register_class(class.to_typing())?;
        }
        for set in self.permission_sets {
            store.put_permission_set(set)?;
        }

        let mut handles: BTreeMap<(String, String), InstanceHandle> = BTreeMap::new();
        for entry in self.instances {
            let params: BTreeMap<String, Value> = entry
                .params
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect();
            let (handle, id) = store.transaction(|tree| {
                let handle = tree.create_instance(&entry.class, params)?;
                let id = tree.get_instance(handle)?.identifiers.to_string();
                Ok((handle, id))
            })?;
            debug!(class = %entry.class, id = %id, "fixture instance created");
            if handles.insert((entry.class.clone(), id.clone()), handle).is_some() {
                return Err(CliError::Fixture(format!(
                    "instance {}:{} is defined twice",
                    entry.class, id
                )));
            }
        }

        let lookup = |key: &InstanceKey| {
            handles
                .get(&(key.class.clone(), key.id.clone()))
                .copied()
                .ok_or_else(|| {
                    CliError::Fixture(format!("unknown instance {}:{}", key.class, key.id))
                })
        };
        for placement in &self.placements {
            let target = lookup(&placement.target)?;
            let owner = match &placement.owner {
                Some(key) => lookup(key)?,
                None => store.root_handle(),
            };
            let field = match (&placement.field, &placement.owner) {
                (Some(field), _) => field.clone(),
                (None, None) => placement.target.class.clone(),
                (None, Some(key)) => {
                    return Err(CliError::Fixture(format!(
                        "placement under {}:{} needs a field",
                        key.class, key.id
                    )))
                }
            };
            store.transaction(|tree| tree.collection(owner, &field)?.append(target))?;
        }

        info!(
            classes = self.classes.len(),
            instances = handles.len(),
            placements = self.placements.len(),
            "fixture loaded"
        );
        Ok(store)
    }
}

/// Read and parse a JSON file.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}
