use serde::{Deserialize, Serialize};

#[derive(Deserialize, Clone, Debug)]
pub struct SaveOrderRequest {
    /// Group names, first shown first.
    pub names: Vec<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SortModeRequest {
    pub enabled: bool,
}

#[derive(Serialize, Clone, Debug)]
pub struct OrderResponse {
    pub server_id: String,
    pub sort_mode: bool,
    /// Saved names in index order.
    pub names: Vec<String>,
}

impl OrderResponse {
    pub fn new(server_id: &str, sort_mode: bool, saved: &crate::order::SavedOrder) -> Self {
        let mut pairs: Vec<(&String, &usize)> = saved.iter().collect();
        pairs.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        Self {
            server_id: server_id.to_string(),
            sort_mode,
            names: pairs.into_iter().map(|(n, _)| n.clone()).collect(),
        }
    }
}
