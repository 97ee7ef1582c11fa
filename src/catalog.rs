//! Product catalog.
//!
//! Maps the product id a device announces in its MAC report onto a
//! capability set and display metadata. Entries come from the
//! configuration file; anything unlisted falls back to a dimmable white
//! light so the entity still surfaces on the bus.

use std::collections::HashMap;

use serde::Deserialize;

/// Broad device class, determining the capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Full colour light: RGB plus tunable white.
    Rgb,
    /// Tunable white light.
    WhiteTemp,
    /// Dimmable white light.
    Dim,
    /// Power plug.
    Plug,
}

/// What a device can do, flattened from the vendor's product families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub light: bool,
    pub color: bool,
    pub white_brightness: bool,
    pub white_temperature: bool,
    pub color_brightness: bool,
}

impl Capabilities {
    /// Home-Assistant component this capability set maps onto.
    pub fn component_type(&self) -> &'static str {
        if self.light {
            "light"
        } else {
            "switch"
        }
    }
}

impl DeviceType {
    pub fn capabilities(self) -> Capabilities {
        match self {
            DeviceType::Rgb => Capabilities {
                light: true,
                color: true,
                white_brightness: true,
                white_temperature: true,
                color_brightness: true,
            },
            DeviceType::WhiteTemp => Capabilities {
                light: true,
                white_brightness: true,
                white_temperature: true,
                ..Capabilities::default()
            },
            DeviceType::Dim => Capabilities {
                light: true,
                white_brightness: true,
                ..Capabilities::default()
            },
            DeviceType::Plug => Capabilities::default(),
        }
    }
}

/// Resolved catalog entry for one product id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub product_id: u8,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub icon: String,
    pub capabilities: Capabilities,
}

impl ProductInfo {
    /// Model string used in discovery when the catalog has no entry.
    pub fn model_or_product_code(&self) -> String {
        if self.model.is_empty() {
            format!("Product: 0x{:02X}", self.product_id)
        } else {
            self.model.clone()
        }
    }
}

/// Catalog lookup table built from configuration.
#[derive(Debug, Default)]
pub struct CatalogResolver {
    products: HashMap<u8, ProductInfo>,
}

impl CatalogResolver {
    pub fn new(products: impl IntoIterator<Item = ProductInfo>) -> Self {
        Self {
            products: products
                .into_iter()
                .map(|info| (info.product_id, info))
                .collect(),
        }
    }

    /// Looks up a product id, falling back to a generic dimmable light.
    pub fn resolve(&self, product_id: u8) -> ProductInfo {
        self.products.get(&product_id).cloned().unwrap_or_else(|| {
            tracing::debug!("product id 0x{:02X} not in catalog, using fallback", product_id);
            ProductInfo {
                product_id,
                name: "Unknown device type".to_string(),
                model: String::new(),
                manufacturer: "AwoX".to_string(),
                icon: "mdi:lightbulb-help-outline".to_string(),
                capabilities: DeviceType::Dim.capabilities(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CatalogResolver {
        CatalogResolver::new([ProductInfo {
            product_id: 0x13,
            name: "SmartLIGHT Color Mesh 9".to_string(),
            model: "SMLm_C9".to_string(),
            manufacturer: "AwoX".to_string(),
            icon: String::new(),
            capabilities: DeviceType::Rgb.capabilities(),
        }])
    }

    #[test]
    fn resolves_known_product() {
        let info = sample().resolve(0x13);
        assert_eq!(info.model, "SMLm_C9");
        assert!(info.capabilities.color);
        assert_eq!(info.capabilities.component_type(), "light");
    }

    #[test]
    fn unknown_product_falls_back_to_dimmable_light() {
        let info = sample().resolve(0x99);
        assert_eq!(info.name, "Unknown device type");
        assert!(info.capabilities.light);
        assert!(!info.capabilities.color);
        assert_eq!(info.model_or_product_code(), "Product: 0x99");
    }

    #[test]
    fn plug_maps_to_switch_component() {
        let caps = DeviceType::Plug.capabilities();
        assert!(!caps.light);
        assert_eq!(caps.component_type(), "switch");
    }
}
