//! 版本包
//!
//! 每个版本包对应一个资源集合。FlannelConfig 记录的版本包版本决定由哪一代
//! 处理器协调该对象。

use flannel_common::{Changelog, Component, Result, VersionBundle};

/// 版本包名称
pub const BUNDLE_NAME: &str = "flannel-operator";

/// 只运行网桥容器的第一代
pub const VERSION_0_1_0: &str = "0.1.0";

/// 增加健康检查容器并使用配置的 etcd 端点
pub const VERSION_0_2_0: &str = "0.2.0";

/// flannel 组件名
pub const FLANNEL_COMPONENT: &str = "flannel";

fn bundle(version: &str, flannel: &str) -> VersionBundle {
    VersionBundle {
        name: BUNDLE_NAME.to_string(),
        version: version.to_string(),
        components: vec![Component {
            name: FLANNEL_COMPONENT.to_string(),
            version: flannel.to_string(),
        }],
        changelogs: vec![Changelog {
            component: FLANNEL_COMPONENT.to_string(),
            description: "Flannel version updated.".to_string(),
            kind: "changed".to_string(),
        }],
    }
}

/// 所有版本包，按版本排列
pub fn version_bundles() -> Vec<VersionBundle> {
    vec![bundle(VERSION_0_1_0, "0.9.0"), bundle(VERSION_0_2_0, "0.10.0")]
}

/// 版本包中 flannel 组件的版本，决定该代部署的 flanneld 镜像
pub fn flannel_version(bundle_version: &str) -> Option<String> {
    version_bundles()
        .into_iter()
        .find(|b| b.version == bundle_version)?
        .components
        .into_iter()
        .find(|c| c.name == FLANNEL_COMPONENT)
        .map(|c| c.version)
}

/// 校验所有版本包，版本不能重复
pub fn validate_bundles(bundles: &[VersionBundle]) -> Result<()> {
    for (i, bundle) in bundles.iter().enumerate() {
        bundle.validate()?;
        if bundles[..i].iter().any(|other| other.version == bundle.version) {
            return Err(flannel_common::Error::InvalidConfig(format!(
                "版本包版本重复: {}",
                bundle.version
            )));
        }
    }
    Ok(())
}
