//! 网络配置条目
//!
//! flanneld 从配置存储中读取的网络配置，以 JSON 形式存放在
//! `coreos.com/network/<网桥名>/config` 路径下。

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// flannel 唯一支持的后端类型
pub const BACKEND_TYPE_VXLAN: &str = "vxlan";

/// 网络配置条目
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    /// 覆盖网络 CIDR
    #[serde(rename = "Network", default)]
    pub network: String,

    /// 子网长度
    #[serde(rename = "SubnetLen", default)]
    pub subnet_len: u32,

    /// 后端配置
    #[serde(rename = "Backend", default)]
    pub backend: Backend,
}

/// 后端配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Backend {
    /// 后端类型，固定为 vxlan
    #[serde(rename = "Type", default)]
    pub backend_type: String,

    /// VXLAN 网络标识
    #[serde(rename = "VNI", default)]
    pub vni: u32,
}

impl NetworkConfig {
    /// 创建 vxlan 网络配置
    pub fn vxlan(network: impl Into<String>, subnet_len: u32, vni: u32) -> Self {
        Self {
            network: network.into(),
            subnet_len,
            backend: Backend {
                backend_type: BACKEND_TYPE_VXLAN.to_string(),
                vni,
            },
        }
    }

    /// 是否为空配置
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// 比较 (CIDR, 子网长度, VNI) 三元组
    ///
    /// 任一字段缺失都视为不同，单个字段变化会触发整体替换。
    pub fn same_network(&self, other: &Self) -> bool {
        self.network == other.network
            && self.subnet_len == other.subnet_len
            && self.backend.vni == other.backend.vni
    }

    /// 序列化为存储使用的 JSON 字符串
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 从存储中的 JSON 字符串解码
    pub fn from_json(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}
