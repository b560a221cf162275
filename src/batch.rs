// Batch grouper.
//
// Pure packing function: no I/O, no async. Input order is preserved
// both within and across groups.

use base64::prelude::{Engine, BASE64_STANDARD};

/// A tile submitted for OCR.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub tile_id: String,
    pub image_bytes: Vec<u8>,
    pub model_override: Option<String>,
}

/// One packed group of tiles, ready to ship as a single HTTP request.
#[derive(Debug, Clone)]
pub struct TileBatch {
    pub tiles: Vec<TileRequest>,
    pub model: Option<String>,
}

impl TileBatch {
    pub fn tile_ids(&self) -> Vec<String> {
        self.tiles.iter().map(|t| t.tile_id.clone()).collect()
    }
}

fn base64_len(bytes: &[u8]) -> usize {
    BASE64_STANDARD.encode(bytes).len()
}

/// Pack `tiles` into groups respecting `max_batch_tiles` and
/// `max_batch_bytes` (measured on base64-encoded size), flushing
/// early whenever the next tile's model override differs from the
/// group's current model.
pub fn group_tiles(tiles: Vec<TileRequest>, max_batch_tiles: usize, max_batch_bytes: usize) -> Vec<TileBatch> {
    let mut batches = Vec::new();
    let mut current: Vec<TileRequest> = Vec::new();
    let mut current_bytes: usize = 0;
    let mut current_model: Option<String> = None;

    for tile in tiles {
        let tile_bytes = base64_len(&tile.image_bytes);
        let model_changes = !current.is_empty() && tile.model_override != current_model;
        let exceeds_tiles = !current.is_empty() && current.len() + 1 > max_batch_tiles;
        let exceeds_bytes = !current.is_empty() && current_bytes + tile_bytes > max_batch_bytes;

        if model_changes || exceeds_tiles || exceeds_bytes {
            batches.push(TileBatch {
                tiles: std::mem::take(&mut current),
                model: current_model.take(),
            });
            current_bytes = 0;
        }

        if current.is_empty() {
            current_model = tile.model_override.clone();
        }
        current_bytes += tile_bytes;
        current.push(tile);

        if current_bytes >= max_batch_bytes {
            batches.push(TileBatch {
                tiles: std::mem::take(&mut current),
                model: current_model.take(),
            });
            current_bytes = 0;
        }
    }

    if !current.is_empty() {
        batches.push(TileBatch {
            tiles: current,
            model: current_model,
        });
    }

    batches
}
