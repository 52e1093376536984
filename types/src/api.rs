use crate::stats::{ChestId, CountersSnapshot, DropRecord, RewardItem, ValidationError};
use serde::{Deserialize, Serialize};

fn default_count() -> u64 {
    1
}

/// Body of `POST /api/stats/increment`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementRequest {
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chest_id: Option<ChestId>,
}

/// Body of `POST /api/drops`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportDropsRequest {
    pub items: Vec<RewardItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDropsResponse {
    pub success: bool,
    /// Length of the recent drops feed after the report.
    pub count: usize,
}

/// Body of `POST /api/admin/chests`. `ids` wins over `id` when both are set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceChestsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ChestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<ChestId>>,
}

impl AnnounceChestsRequest {
    pub fn into_ids(self) -> Result<Vec<ChestId>, ValidationError> {
        let ids = match (self.ids, self.id) {
            (Some(ids), _) => ids,
            (None, Some(id)) => vec![id],
            (None, None) => Vec::new(),
        };
        if ids.is_empty() {
            return Err(ValidationError::NoChests);
        }
        Ok(ids)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceChestsResponse {
    pub success: bool,
    /// Every chest announced so far, in announcement order.
    pub ids: Vec<ChestId>,
}

/// Body of `GET /api/admin/recent`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentChests {
    pub ids: Vec<ChestId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Message pushed over the live update channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Update {
    /// Full state, sent once when a subscriber connects.
    Snapshot {
        counters: CountersSnapshot,
        drops: Vec<DropRecord>,
    },
    CountersUpdate(CountersSnapshot),
    DropsUpdate { items: Vec<DropRecord> },
    /// Chests announced since the previous update.
    NewChests { ids: Vec<ChestId> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_increment_request_defaults() {
        let request: IncrementRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.count, 1);
        assert_eq!(request.chest_id, None);

        let request: IncrementRequest =
            serde_json::from_str(r#"{"count": 0, "chestId": 12}"#).unwrap();
        assert_eq!(request.count, 0);
        assert_eq!(request.chest_id, Some(12));

        assert!(serde_json::from_str::<IncrementRequest>(r#"{"count": -2}"#).is_err());
    }

    #[test]
    fn test_announce_ids_precedence() {
        let request = AnnounceChestsRequest {
            id: Some(1),
            ids: Some(vec![2, 3]),
        };
        assert_eq!(request.into_ids(), Ok(vec![2, 3]));

        let request = AnnounceChestsRequest {
            id: Some(1),
            ids: None,
        };
        assert_eq!(request.into_ids(), Ok(vec![1]));

        assert_eq!(
            AnnounceChestsRequest::default().into_ids(),
            Err(ValidationError::NoChests)
        );
        let request = AnnounceChestsRequest {
            id: None,
            ids: Some(vec![]),
        };
        assert_eq!(request.into_ids(), Err(ValidationError::NoChests));
    }

    #[test]
    fn test_update_tags() {
        let counters = CountersSnapshot {
            total_opened: 3,
            per_chest_counts: BTreeMap::from([(7, 3)]),
            most_popular_chest_id: Some(7),
        };
        let value = serde_json::to_value(Update::CountersUpdate(counters.clone())).unwrap();
        assert_eq!(value["type"], "counters-update");
        assert_eq!(value["totalOpened"], 3);
        assert_eq!(value["perChestCounts"]["7"], 3);
        assert_eq!(value["mostPopularChestId"], 7);

        let value = serde_json::to_value(Update::NewChests { ids: vec![4] }).unwrap();
        assert_eq!(value["type"], "new-chests");

        let encoded = serde_json::to_string(&Update::Snapshot {
            counters: counters.clone(),
            drops: Vec::new(),
        })
        .unwrap();
        let decoded: Update = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            decoded,
            Update::Snapshot {
                counters,
                drops: Vec::new()
            }
        );
    }
}
