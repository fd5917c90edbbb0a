//! In-memory [`ObjectStore`] that mimics the API server semantics reconcilers rely on:
//! optimistic concurrency, finalizers blocking deletion and merge patches.

use std::{
    collections::BTreeMap,
    sync::Mutex,
};

use async_trait::async_trait;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc, ByteString};
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

use super::ObjectStore;
use crate::client::api_error;

pub struct InMemoryStore<K> {
    state: Mutex<State<K>>,
}

struct State<K> {
    objects: BTreeMap<String, K>,
    journal: Vec<String>,
    failing_verbs: BTreeMap<&'static str, u16>,
    version: u64,
}

impl<K> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                journal: Vec::new(),
                failing_verbs: BTreeMap::new(),
                version: 0,
            }),
        }
    }
}

impl<K> InMemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for mut object in objects {
                state.version += 1;
                object.meta_mut().resource_version = Some(state.version.to_string());
                state.objects.insert(object.name_any(), object);
            }
        }
        store
    }

    /// Current state of `name`, bypassing the journal.
    pub fn get(&self, name: &str) -> Option<K> {
        self.lock().objects.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Mutating calls in order, as `"<verb> <name>"`.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Makes every call of `verb` fail with `500 InternalError` until [`Self::heal`].
    pub fn fail(&self, verb: &'static str) {
        self.fail_with(verb, 500);
    }

    /// Makes every call of `verb` fail with the status `code` until [`Self::heal`].
    pub fn fail_with(&self, verb: &'static str, code: u16) {
        self.lock().failing_verbs.insert(verb, code);
    }

    pub fn heal(&self) {
        self.lock().failing_verbs.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K> State<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    fn check(&mut self, verb: &'static str, name: &str) -> kube::Result<()> {
        if let Some(&code) = self.failing_verbs.get(verb) {
            let reason = match code {
                404 => "NotFound",
                409 => "Conflict",
                _ => "InternalError",
            };
            return Err(api_error(
                code,
                reason,
                format!("injected failure for {verb} {name}"),
            ));
        }
        Ok(())
    }

    fn record(&mut self, verb: &str, name: &str) {
        self.journal.push(format!("{verb} {name}"));
    }

    fn store(&mut self, name: &str, mut object: K) -> K {
        self.version += 1;
        object.meta_mut().resource_version = Some(self.version.to_string());
        object.meta_mut().name = Some(name.to_owned());
        let released = object.meta().deletion_timestamp.is_some() && object.finalizers().is_empty();
        if released {
            self.objects.remove(name);
        } else {
            self.objects.insert(name.to_owned(), object.clone());
        }
        object
    }

    fn existing(&self, name: &str) -> kube::Result<K> {
        self.objects
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))
    }

    fn patched(&self, name: &str, patch: &serde_json::Value) -> kube::Result<K> {
        let mut value = serde_json::to_value(self.existing(name)?).map_err(kube::Error::SerdeError)?;
        merge(&mut value, patch);
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for InMemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get_opt(&self, name: &str) -> kube::Result<Option<K>> {
        let mut state = self.lock();
        state.check("get", name)?;
        Ok(state.objects.get(name).cloned())
    }

    async fn list(&self) -> kube::Result<Vec<K>> {
        let mut state = self.lock();
        state.check("list", "")?;
        Ok(state.objects.values().cloned().collect())
    }

    async fn create(&self, object: &K) -> kube::Result<K> {
        let name = object.name_any();
        let mut state = self.lock();
        state.check("create", &name)?;
        if state.objects.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }
        let mut object = normalized(object)?;
        state.record("create", &name);
        object.meta_mut().deletion_timestamp = None;
        Ok(state.store(&name, object))
    }

    async fn replace(&self, name: &str, object: &K) -> kube::Result<K> {
        let mut state = self.lock();
        state.check("replace", name)?;
        let existing = state.existing(name)?;
        let expected = object.meta().resource_version.as_ref();
        if expected.is_some() && expected != existing.meta().resource_version.as_ref() {
            return Err(api_error(409, "Conflict", format!("{name} has been modified")));
        }
        let mut object = normalized(object)?;
        state.record("replace", name);
        object.meta_mut().deletion_timestamp = existing.meta().deletion_timestamp.clone();
        Ok(state.store(name, object))
    }

    async fn delete(&self, name: &str) -> kube::Result<()> {
        let mut state = self.lock();
        state.check("delete", name)?;
        let Some(mut object) = state.objects.get(name).cloned() else {
            return Ok(());
        };
        state.record("delete", name);
        if object.meta().deletion_timestamp.is_none() {
            object.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        }
        state.store(name, object);
        Ok(())
    }

    async fn merge_patch(&self, name: &str, patch: serde_json::Value) -> kube::Result<K> {
        let mut state = self.lock();
        state.check("patch", name)?;
        let object = state.patched(name, &patch)?;
        state.record("patch", name);
        Ok(state.store(name, object))
    }

    async fn merge_patch_status(&self, name: &str, patch: serde_json::Value) -> kube::Result<K> {
        let mut state = self.lock();
        state.check("patch-status", name)?;
        let status_only = serde_json::json!({ "status": patch.get("status").cloned() });
        let object = state.patched(name, &status_only)?;
        state.record("patch-status", name);
        Ok(state.store(name, object))
    }
}

/// Folds Secret `stringData` into base64 `data`, as the API server does on writes.
fn normalized<K>(object: &K) -> kube::Result<K>
where
    K: Clone + Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
    let Some(serde_json::Value::Object(string_data)) = value
        .as_object_mut()
        .and_then(|fields| fields.remove("stringData"))
    else {
        return Ok(object.clone());
    };

    let mut data = serde_json::Map::new();
    for (key, text) in string_data {
        let text = text.as_str().unwrap_or_default().as_bytes().to_vec();
        data.insert(
            key,
            serde_json::to_value(ByteString(text)).map_err(kube::Error::SerdeError)?,
        );
    }
    merge(
        &mut value,
        &serde_json::json!({ "data": serde_json::Value::Object(data) }),
    );
    serde_json::from_value(value).map_err(kube::Error::SerdeError)
}

fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge(target.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
    }
}
