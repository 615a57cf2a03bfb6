use std::collections::BTreeSet;

use crate::models::ModelDescriptor;

/**
 * \brief 按关键字与 provider 过滤模型目录。
 * \param search   对名称或 provider 做不区分大小写的子串匹配
 * \param provider 精确匹配的 provider
 */
pub fn filter_models<'a>(
    models: &'a [ModelDescriptor],
    search: Option<&str>,
    provider: Option<&str>,
) -> Vec<&'a ModelDescriptor> {
    let needle = search
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    models
        .iter()
        .filter(|m| match &needle {
            Some(n) => m.name.to_lowercase().contains(n) || m.provider.to_lowercase().contains(n),
            None => true,
        })
        .filter(|m| provider.map(|p| m.provider == p).unwrap_or(true))
        .collect()
}

/**
 * \brief 目录中出现的 provider，排序去重。
 */
pub fn provider_names(models: &[ModelDescriptor]) -> Vec<String> {
    models
        .iter()
        .map(|m| m.provider.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/**
 * \brief 按 ID 从目录中挑选模型，保持请求顺序；返回找不到的 ID。
 */
pub fn select_models(
    models: &[ModelDescriptor],
    ids: &[String],
) -> (Vec<ModelDescriptor>, Vec<String>) {
    let mut selected = Vec::new();
    let mut missing = Vec::new();
    for id in ids {
        match models.iter().find(|m| &m.id == id) {
            Some(model) if !selected.iter().any(|s: &ModelDescriptor| &s.id == id) => {
                selected.push(model.clone())
            }
            Some(_) => {}
            None => missing.push(id.clone()),
        }
    }
    (selected, missing)
}
