//! C2: tile transformer. Drops layers not in the keep-set and filters the
//! `streets` layer's features down to a whitelisted set of road kinds.

use std::collections::HashSet;

use crate::codec::{Layer, Tile, Value};

pub const STREETS_LAYER: &str = "streets";

/// Road `kind` values retained in the `streets` layer.
pub const STREET_KIND_WHITELIST: &[&str] = &[
    "track",
    "path",
    "service",
    "unclassified",
    "residential",
    "tertiary",
    "secondary",
    "primary",
    "trunk",
    "living_street",
    "pedestrian",
    "taxiway",
    "busway",
];

/// Apply the keep-set and street-kind filter to a decoded tile.
///
/// Returns the (possibly unchanged) tile and whether anything was actually
/// removed. Layer order is preserved; keys/values tables are left intact
/// even when entries become unreferenced.
pub fn transform(tile: Tile, layers_to_keep: &HashSet<String>) -> (Tile, bool) {
    let mut modified = false;
    let mut layers = Vec::with_capacity(tile.layers.len());

    for layer in tile.layers {
        if !layers_to_keep.contains(&layer.name) {
            modified = true;
            continue;
        }
        if layer.name == STREETS_LAYER {
            let (filtered, changed) = filter_streets_layer(layer);
            modified |= changed;
            layers.push(filtered);
        } else {
            layers.push(layer);
        }
    }

    (Tile { layers }, modified)
}

fn filter_streets_layer(mut layer: Layer) -> (Layer, bool) {
    let kind_key_index = layer.keys.iter().position(|k| k == "kind");
    let Some(kind_key_index) = kind_key_index else {
        // No `kind` tag in this layer at all: nothing to filter on, keep
        // every feature rather than guessing.
        return (layer, false);
    };
    let kind_key_index = kind_key_index as u32;

    let whitelist: HashSet<&str> = STREET_KIND_WHITELIST.iter().copied().collect();
    let before = layer.features.len();

    layer.features.retain(
        |feature| match feature_kind(feature, &layer.values, kind_key_index) {
            Some(kind) => whitelist.contains(kind),
            // Malformed or missing tag pair: defensive, keep the feature.
            None => true,
        },
    );

    let modified = layer.features.len() != before;
    (layer, modified)
}

/// Look up the `kind` tag's string value for a feature, tolerating
/// malformed tag-index pairs (odd length, out-of-range index, or a
/// non-string value) by returning `None` rather than panicking or
/// dropping the feature.
fn feature_kind<'a>(
    feature: &crate::codec::Feature,
    values: &'a [Value],
    kind_key_index: u32,
) -> Option<&'a str> {
    for pair in feature.tags.chunks_exact(2) {
        let [key_idx, value_idx] = pair else {
            unreachable!("chunks_exact(2) always yields length-2 slices")
        };
        if *key_idx == kind_key_index {
            return match values.get(*value_idx as usize) {
                Some(Value::String(s)) => Some(s.as_str()),
                _ => None,
            };
        }
    }
    None
}
