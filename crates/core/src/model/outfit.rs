use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutfitCategory {
    Hair,
    Head,
    Body,
    Clothing,
    Accessories,
    Other,
}

impl OutfitCategory {
    pub const ORDER: [OutfitCategory; 6] = [
        OutfitCategory::Hair,
        OutfitCategory::Head,
        OutfitCategory::Body,
        OutfitCategory::Clothing,
        OutfitCategory::Accessories,
        OutfitCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutfitCategory::Hair => "hair",
            OutfitCategory::Head => "head",
            OutfitCategory::Body => "body",
            OutfitCategory::Clothing => "clothing",
            OutfitCategory::Accessories => "accessories",
            OutfitCategory::Other => "other",
        }
    }
}

// Checked in order; accessories before clothing so "hair_ribbon" stays an
// accessory, hair before head so "head_hair" is hair.
static PATTERNS: Lazy<Vec<(OutfitCategory, Regex)>> = Lazy::new(|| {
    [
        (
            OutfitCategory::Accessories,
            r"(?i)acc|ribbon|hat|cap\b|glass|ring|necklace|choker|bow\b|bag|pin|アクセ|リボン",
        ),
        (
            OutfitCategory::Hair,
            r"(?i)hair|bang|fringe|ponytail|twintail|ahoge|髪",
        ),
        (
            OutfitCategory::Head,
            r"(?i)head|face|eye|brow|lash|mouth|teeth|tooth|tongue|ear|顔|目|口",
        ),
        (
            OutfitCategory::Clothing,
            r"(?i)cloth|shirt|skirt|dress|pants|jacket|coat|shoe|boot|sock|uniform|tops|bottoms|服|スカート|靴",
        ),
        (
            OutfitCategory::Body,
            r"(?i)body|skin|neck|arm|leg|hand|foot|torso|体|肌",
        ),
    ]
    .into_iter()
    .filter_map(|(category, pattern)| match Regex::new(pattern) {
        Ok(regex) => Some((category, regex)),
        Err(err) => {
            tracing::error!(%err, category = category.as_str(), "invalid outfit pattern");
            None
        }
    })
    .collect()
});

pub fn categorize_mesh(name: &str) -> OutfitCategory {
    PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(name))
        .map(|(category, _)| *category)
        .unwrap_or(OutfitCategory::Other)
}

/// Named group of meshes whose visibility is toggled together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutfitPart {
    pub name: String,
    pub visible: bool,
    pub mesh_names: Vec<String>,
}

/// Groups `mesh_names` by category, skipping empty categories.
pub fn infer_parts<'a>(mesh_names: impl IntoIterator<Item = &'a str>) -> Vec<OutfitPart> {
    let mut parts: Vec<OutfitPart> = OutfitCategory::ORDER
        .iter()
        .map(|category| OutfitPart {
            name: category.as_str().to_string(),
            visible: true,
            mesh_names: Vec::new(),
        })
        .collect();

    for name in mesh_names {
        let category = categorize_mesh(name);
        let slot = OutfitCategory::ORDER
            .iter()
            .position(|c| *c == category)
            .unwrap_or(OutfitCategory::ORDER.len() - 1);
        if !parts[slot].mesh_names.iter().any(|existing| existing == name) {
            parts[slot].mesh_names.push(name.to_string());
        }
    }

    parts.retain(|part| !part.mesh_names.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_common_names() {
        assert_eq!(categorize_mesh("Hair_Front"), OutfitCategory::Hair);
        assert_eq!(categorize_mesh("Face_mesh"), OutfitCategory::Head);
        assert_eq!(categorize_mesh("Body_Skin"), OutfitCategory::Body);
        assert_eq!(categorize_mesh("Skirt"), OutfitCategory::Clothing);
        assert_eq!(categorize_mesh("hair_ribbon"), OutfitCategory::Accessories);
        assert_eq!(categorize_mesh("スカート"), OutfitCategory::Clothing);
        assert_eq!(categorize_mesh("Mesh.001"), OutfitCategory::Other);
    }

    #[test]
    fn groups_meshes_into_parts() {
        let parts = infer_parts(["Hair", "Bangs", "Shirt", "Mesh.001", "Hair"]);
        let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();

        assert_eq!(names, vec!["hair", "clothing", "other"]);
        assert_eq!(parts[0].mesh_names, vec!["Hair", "Bangs"]);
        assert!(parts.iter().all(|p| p.visible));
    }
}
