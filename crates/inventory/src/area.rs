use serde::{Deserialize, Serialize};

use inventrack_core::AreaId;

/// Organizational unit as supplied by the area directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub name: String,
    pub parent_id: Option<AreaId>,
}

impl Area {
    pub fn root(id: AreaId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id: None,
        }
    }

    pub fn child(id: AreaId, name: impl Into<String>, parent_id: AreaId) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id: Some(parent_id),
        }
    }
}
