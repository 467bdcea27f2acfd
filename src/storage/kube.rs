use std::{future::Future, time::Duration};

use anyhow::{Context as _, Result};
use kube::{
    Client, Config,
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    },
};
use log::debug;
use serde_json::{Value, json};
use tokio::runtime::Runtime;

use crate::core::{
    context::Context,
    types::{ResourceKey, StoredResource},
};
use crate::storage::store::{LabelSelector, ResourceStore, StoreError};

/// Resource store backed by the Kubernetes API.
///
/// The kube client is async; every call is driven to completion on a private
/// runtime so reconcilers stay synchronous.
pub struct KubeResourceStore {
    client: Client,
    runtime: Runtime,
}

impl KubeResourceStore {
    /// Uses the in-cluster or kubeconfig configuration.
    pub fn try_default() -> Result<Self> {
        let runtime = Self::build_runtime()?;
        let client = runtime
            .block_on(Client::try_default())
            .context("failed to build Kubernetes client")?;
        Ok(Self { client, runtime })
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let runtime = Self::build_runtime()?;
        let client = {
            let _guard = runtime.enter();
            Client::try_from(config).context("failed to build Kubernetes client")?
        };
        Ok(Self { client, runtime })
    }

    fn build_runtime() -> Result<Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("kube-store")
            .enable_all()
            .build()
            .context("Failed to create tokio runtime")
    }

    fn api<R: StoredResource>(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &ApiResource::erase::<R>(&()))
    }

    /// Blocks on `fut`, giving up as soon as `ctx` is cancelled or past its deadline.
    fn run<T, F>(&self, ctx: &Context, kind: &str, key: &ResourceKey, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        ctx.check()?;
        let outcome = self.runtime.block_on(async {
            let watch = async {
                loop {
                    if let Err(cancelled) = ctx.check() {
                        return cancelled;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            };
            tokio::select! {
                result = fut => Ok(result),
                cancelled = watch => Err(cancelled),
            }
        });
        match outcome {
            Ok(result) => result.map_err(|err| map_error(kind, key, err)),
            Err(cancelled) => {
                debug!("[store] {kind} {key} request abandoned: {cancelled}");
                Err(StoreError::Cancelled(cancelled))
            }
        }
    }

    fn to_dynamic<R: StoredResource>(resource: &R) -> Result<DynamicObject, StoreError> {
        let mut value = serde_json::to_value(resource)?;
        Self::set_type_meta::<R>(&mut value);
        Ok(serde_json::from_value(value)?)
    }

    fn from_dynamic<R: StoredResource>(object: DynamicObject) -> Result<R, StoreError> {
        Ok(serde_json::from_value(serde_json::to_value(object)?)?)
    }

    fn set_type_meta<R: StoredResource>(value: &mut Value) {
        if let Some(object) = value.as_object_mut() {
            object.insert("apiVersion".into(), Value::from(R::api_version(&()).as_ref()));
            object.insert("kind".into(), Value::from(R::kind(&()).as_ref()));
        }
    }

    /// Apply body holding only the fields this field manager owns.
    fn apply_body<R: StoredResource>(resource: &R, status_only: bool) -> Result<Value, StoreError> {
        let mut value = serde_json::to_value(resource)?;
        let meta = resource.meta();
        let Some(object) = value.as_object_mut() else {
            return Err(StoreError::Serialization("resource is not a JSON object".into()));
        };
        let metadata = if status_only {
            json!({ "name": meta.name, "namespace": meta.namespace })
        } else {
            json!({
                "name": meta.name,
                "namespace": meta.namespace,
                "labels": meta.labels,
                "annotations": meta.annotations,
                "finalizers": meta.finalizers.clone().unwrap_or_default(),
            })
        };
        object.insert("metadata".into(), metadata);
        if status_only {
            object.retain(|field, _| field == "metadata" || field == "status");
        } else {
            object.remove("status");
        }
        Self::set_type_meta::<R>(&mut value);
        Ok(value)
    }

    fn selector_string(selector: &LabelSelector) -> String {
        selector
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn map_error(kind: &str, key: &ResourceKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            },
            409 if response.reason == "AlreadyExists" => StoreError::AlreadyExists {
                kind: kind.to_string(),
                key: key.clone(),
            },
            409 => StoreError::Conflict {
                kind: kind.to_string(),
                key: key.clone(),
                expected: "local".into(),
                actual: response.message,
            },
            400 | 422 => StoreError::Invalid {
                kind: kind.to_string(),
                key: key.clone(),
                reason: response.message,
            },
            _ => StoreError::Unavailable(format!("{} ({})", response.message, response.code)),
        },
        kube::Error::SerdeError(err) => StoreError::Serialization(err.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

impl ResourceStore for KubeResourceStore {
    fn get<R: StoredResource>(&self, ctx: &Context, key: &ResourceKey) -> Result<R, StoreError> {
        let kind = R::kind(&());
        let api = self.api::<R>(&key.namespace);
        let object = self.run(ctx, &kind, key, api.get(&key.name))?;
        Self::from_dynamic(object)
    }

    fn list<R: StoredResource>(
        &self,
        ctx: &Context,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<R>, StoreError> {
        let kind = R::kind(&());
        let api = self.api::<R>(namespace);
        let mut params = ListParams::default();
        if let Some(selector) = selector.filter(|selector| !selector.is_empty()) {
            params = params.labels(&Self::selector_string(selector));
        }
        let key = ResourceKey::new(namespace, "");
        let list = self.run(ctx, &kind, &key, api.list(&params))?;
        list.items.into_iter().map(Self::from_dynamic).collect()
    }

    fn create<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError> {
        let kind = R::kind(&());
        let key = resource.resource_key();
        let api = self.api::<R>(&key.namespace);
        let object = Self::to_dynamic(resource)?;
        let created = self.run(ctx, &kind, &key, api.create(&PostParams::default(), &object))?;
        debug!("[store] created {kind} {key}");
        Self::from_dynamic(created)
    }

    fn delete<R: StoredResource>(&self, ctx: &Context, key: &ResourceKey) -> Result<(), StoreError> {
        let kind = R::kind(&());
        let api = self.api::<R>(&key.namespace);
        self.run(ctx, &kind, key, api.delete(&key.name, &DeleteParams::default()))?;
        debug!("[store] deleted {kind} {key}");
        Ok(())
    }

    fn update_status<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError> {
        let kind = R::kind(&());
        let key = resource.resource_key();
        let api = self.api::<R>(&key.namespace);
        // resourceVersion in a merge patch is a precondition.
        let patch = json!({
            "metadata": { "resourceVersion": resource.meta().resource_version },
            "status": serde_json::to_value(resource.status())?,
        });
        let updated = self.run(
            ctx,
            &kind,
            &key,
            api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch)),
        )?;
        Self::from_dynamic(updated)
    }

    fn update<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError> {
        let kind = R::kind(&());
        let key = resource.resource_key();
        let api = self.api::<R>(&key.namespace);
        let object = Self::to_dynamic(resource)?;
        let updated = self.run(
            ctx,
            &kind,
            &key,
            api.replace(&key.name, &PostParams::default(), &object),
        )?;
        Self::from_dynamic(updated)
    }

    fn apply_status<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
        field_manager: &str,
    ) -> Result<R, StoreError> {
        let kind = R::kind(&());
        let key = resource.resource_key();
        let api = self.api::<R>(&key.namespace);
        let body = Self::apply_body(resource, true)?;
        let params = PatchParams::apply(field_manager).force();
        let applied = self.run(
            ctx,
            &kind,
            &key,
            api.patch_status(&key.name, &params, &Patch::Apply(&body)),
        )?;
        Self::from_dynamic(applied)
    }

    fn apply<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
        field_manager: &str,
    ) -> Result<R, StoreError> {
        let kind = R::kind(&());
        let key = resource.resource_key();
        let api = self.api::<R>(&key.namespace);
        let body = Self::apply_body(resource, false)?;
        let params = PatchParams::apply(field_manager).force();
        let applied = self.run(ctx, &kind, &key, api.patch(&key.name, &params, &Patch::Apply(&body)))?;
        Self::from_dynamic(applied)
    }
}
