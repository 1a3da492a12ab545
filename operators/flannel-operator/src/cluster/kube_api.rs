//! 基于 kube-rs 的集群 API

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;

use flannel_common::{Error, Result};

use super::ObjectApi;
use crate::crd::FlannelConfig;

/// 知道如何按作用域构造 `Api` 的资源类型
pub trait ScopedResource:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! impl_namespaced {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ScopedResource for $kind {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! impl_cluster_scoped {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ScopedResource for $kind {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

impl_namespaced!(ServiceAccount, DaemonSet, Job, Pod, FlannelConfig);
impl_cluster_scoped!(Namespace, ClusterRoleBinding, Node);

/// kube-rs 实现
pub struct KubeApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeApi<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: ScopedResource> ObjectApi<K> for KubeApi<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let api = K::api(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list(&self, namespace: Option<&str>, labels: Option<&str>) -> Result<Vec<K>> {
        let api = K::api(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(labels) = labels {
            params = params.labels(labels);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, namespace: Option<&str>, obj: &K) -> Result<K> {
        let api = K::api(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, namespace: Option<&str>, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::InvalidConfig("替换的对象缺少名称".into()))?;
        let api = K::api(self.client.clone(), namespace);
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let api = K::api(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }
}
