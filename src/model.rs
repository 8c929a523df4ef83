//! Square catalog objects as returned by the Catalog and Inventory APIs.
//!
//! Only the fields the sync maps are modelled; everything else in the
//! payload is ignored on deserialization.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fields shared by every catalog object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogObject {
    Item(CatalogItem),
    ItemVariation(CatalogVariation),
    Category(CatalogCategory),
    Image(CatalogImage),
    #[serde(other)]
    Other,
}

impl CatalogObject {
    pub fn id(&self) -> Option<&str> {
        match self {
            CatalogObject::Item(o) => o.meta.id.as_deref(),
            CatalogObject::ItemVariation(o) => o.meta.id.as_deref(),
            CatalogObject::Category(o) => o.meta.id.as_deref(),
            CatalogObject::Image(o) => o.meta.id.as_deref(),
            CatalogObject::Other => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogItem {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    /// Legacy single-image reference; newer payloads use `item_data.image_ids`.
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub item_data: Option<ItemData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ItemData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_plaintext: Option<String>,
    #[serde(default)]
    pub description_html: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub reporting_category: Option<CategoryRef>,
    #[serde(default)]
    pub categories: Vec<CategoryRef>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    #[serde(default)]
    pub variations: Vec<CatalogObject>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CategoryRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogVariation {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub item_variation_data: Option<VariationData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VariationData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price_money: Option<Money>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Money {
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogCategory {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub category_data: Option<CategoryData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CategoryData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_category: Option<CategoryRef>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl CategoryData {
    pub fn parent(&self) -> Option<&str> {
        self.parent_category
            .as_ref()
            .and_then(|p| p.id.as_deref())
            .or(self.parent_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogImage {
    #[serde(flatten)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub image_data: Option<ImageData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageData {
    #[serde(default)]
    pub url: Option<String>,
}

/// One entry from `POST /v2/inventory/counts/batch-retrieve`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InventoryCount {
    #[serde(default)]
    pub catalog_object_id: Option<String>,
    #[serde(default)]
    pub catalog_object_type: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    /// Square sends quantities as decimal strings.
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub calculated_at: Option<DateTime<Utc>>,
}

/// Objects fetched for one batch: primary objects plus cross-referenced ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPage {
    pub objects: Vec<CatalogObject>,
    pub related_objects: Vec<CatalogObject>,
    pub cursor: Option<String>,
}

impl CatalogPage {
    /// A page with nothing in it and no continuation marks end of catalog.
    pub fn is_terminal_empty(&self) -> bool {
        self.objects.is_empty() && self.related_objects.is_empty() && self.cursor.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryPage {
    pub objects: Vec<CatalogObject>,
    pub cursor: Option<String>,
}

/// Treat blank continuation tokens as absent.
pub fn normalize_cursor(cursor: Option<String>) -> Option<String> {
    cursor.filter(|c| !c.trim().is_empty())
}
