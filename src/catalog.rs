use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{RoomInfo, SnackInfo};

#[derive(Debug)]
pub enum CatalogError {
    /// The catalog could not be reached; the lookup may succeed later.
    Unavailable(String),
    Load(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Unavailable(msg) => write!(f, "catalog unavailable: {msg}"),
            CatalogError::Load(msg) => write!(f, "catalog load failed: {msg}"),
        }
    }
}

impl std::error::Error for CatalogError {}

#[async_trait]
pub trait RoomCatalog: Send + Sync {
    async fn get_room(&self, id: Ulid) -> Result<Option<RoomInfo>, CatalogError>;
}

#[async_trait]
pub trait SnackCatalog: Send + Sync {
    async fn get_snack(&self, id: Ulid) -> Result<Option<SnackInfo>, CatalogError>;
}

/// On-disk shape of a catalog file.
#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    rooms: Vec<RoomInfo>,
    #[serde(default)]
    snacks: Vec<SnackInfo>,
}

/// Rooms and snacks held in memory, optionally seeded from a JSON file:
///
/// ```json
/// { "rooms":  [{ "id": "01J…", "name": "Orchid", "type": "small", "capacity": 8, "hourly_rate": "100000" }],
///   "snacks": [{ "id": "01J…", "name": "Lunch box", "unit_price": "50000", "category": "lunch" }] }
/// ```
#[derive(Default)]
pub struct InMemoryCatalog {
    rooms: DashMap<Ulid, RoomInfo>,
    snacks: DashMap<Ulid, SnackInfo>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_json::from_str(json).map_err(|e| CatalogError::Load(e.to_string()))?;
        let catalog = Self::new();
        for room in file.rooms {
            catalog.insert_room(room);
        }
        for snack in file.snacks {
            catalog.insert_snack(snack);
        }
        Ok(catalog)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Load(format!("{}: {e}", path.display())))?;
        let catalog = Self::from_json_str(&json)?;
        tracing::info!(
            "catalog loaded from {}: {} rooms, {} snacks",
            path.display(),
            catalog.rooms.len(),
            catalog.snacks.len()
        );
        Ok(catalog)
    }

    pub fn insert_room(&self, room: RoomInfo) {
        self.rooms.insert(room.id, room);
    }

    pub fn insert_snack(&self, snack: SnackInfo) {
        self.snacks.insert(snack.id, snack);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[async_trait]
impl RoomCatalog for InMemoryCatalog {
    async fn get_room(&self, id: Ulid) -> Result<Option<RoomInfo>, CatalogError> {
        Ok(self.rooms.get(&id).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl SnackCatalog for InMemoryCatalog {
    async fn get_snack(&self, id: Ulid) -> Result<Option<SnackInfo>, CatalogError> {
        Ok(self.snacks.get(&id).map(|s| s.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    #[tokio::test]
    async fn loads_rooms_and_snacks_from_json() {
        let room_id = Ulid::new();
        let snack_id = Ulid::new();
        let json = format!(
            r#"{{
                "rooms": [{{ "id": "{room_id}", "name": "Orchid", "type": "small",
                             "capacity": 8, "hourly_rate": "100000" }}],
                "snacks": [{{ "id": "{snack_id}", "name": "Lunch box",
                              "unit_price": "50000.50", "category": "lunch" }}]
            }}"#
        );
        let catalog = InMemoryCatalog::from_json_str(&json).unwrap();

        let room = catalog.get_room(room_id).await.unwrap().unwrap();
        assert_eq!(room.kind, "small");
        assert_eq!(room.capacity, 8);
        assert_eq!(room.hourly_rate, Decimal::from(100_000));
        assert_eq!(room.image_path, "");

        let snack = catalog.get_snack(snack_id).await.unwrap().unwrap();
        assert_eq!(snack.unit_price, Decimal::new(5_000_050, 2));

        assert!(catalog.get_room(Ulid::new()).await.unwrap().is_none());
        assert!(catalog.get_snack(room_id).await.unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_a_load_error() {
        assert!(matches!(
            InMemoryCatalog::from_json_str("{ rooms: ").err(),
            Some(CatalogError::Load(_))
        ));
    }

    #[test]
    fn missing_sections_are_empty() {
        let catalog = InMemoryCatalog::from_json_str("{}").unwrap();
        assert_eq!(catalog.room_count(), 0);
    }
}
