//! Chunk storage and terrain.
//!
//! The server core only needs [`ChunkStore::get_or_create`]. [`ChunkManager`]
//! is the in-memory store used by the binary, filled by a [`TerrainGenerator`].

use protocol::{BlockId, ChunkPosition, CHUNK_SIZE, CHUNK_VOLUME};
use std::collections::HashMap;
use tracing::debug;

/// Block values written by the bundled generators.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Air = 0,
    Grass = 1,
    Dirt = 2,
    Stone = 3,
}

impl From<BlockType> for BlockId {
    fn from(block: BlockType) -> Self {
        block as BlockId
    }
}

/// A cube of `CHUNK_SIZE`³ blocks.
///
/// Blocks are stored y-major: `x + CHUNK_SIZE * (z + CHUNK_SIZE * y)`. This is
/// also the order they go on the wire.
#[derive(Debug, Clone)]
pub struct Chunk {
    position: ChunkPosition,
    blocks: Box<[BlockId]>,
}

impl Chunk {
    /// An all-air chunk.
    pub fn new(position: ChunkPosition) -> Self {
        Self {
            position,
            blocks: vec![BlockType::Air.into(); CHUNK_VOLUME].into_boxed_slice(),
        }
    }

    pub fn position(&self) -> ChunkPosition {
        self.position
    }

    #[inline]
    pub fn index(x: usize, y: usize, z: usize) -> usize {
        debug_assert!(x < CHUNK_SIZE && y < CHUNK_SIZE && z < CHUNK_SIZE);
        x + CHUNK_SIZE * (z + CHUNK_SIZE * y)
    }

    pub fn block(&self, x: usize, y: usize, z: usize) -> BlockId {
        self.blocks[Self::index(x, y, z)]
    }

    pub fn set_block(&mut self, x: usize, y: usize, z: usize, block: BlockId) {
        self.blocks[Self::index(x, y, z)] = block;
    }

    /// Flat grid in storage order.
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// World-space y of the chunk's lowest block layer.
    ///
    /// Chunk coordinates span the full `i32` range, so block coordinates
    /// need `i64`.
    pub fn base_y(&self) -> i64 {
        i64::from(self.position.y) * CHUNK_SIZE as i64
    }
}

/// Fills freshly allocated chunks.
pub trait TerrainGenerator {
    fn fill(&self, chunk: &mut Chunk);
}

/// Layered flat world: grass on top of dirt on top of stone.
#[derive(Debug, Clone, Copy)]
pub struct FlatTerrain {
    /// World-space y of the first air layer.
    pub ground_height: i32,
}

impl FlatTerrain {
    pub fn block_at(&self, world_y: i64) -> BlockType {
        let ground = i64::from(self.ground_height);
        if world_y >= ground {
            BlockType::Air
        } else if world_y == ground - 1 {
            BlockType::Grass
        } else if world_y >= ground - 4 {
            BlockType::Dirt
        } else {
            BlockType::Stone
        }
    }
}

impl TerrainGenerator for FlatTerrain {
    fn fill(&self, chunk: &mut Chunk) {
        let base_y = chunk.base_y();
        for y in 0..CHUNK_SIZE {
            let block = BlockId::from(self.block_at(base_y + y as i64));
            for z in 0..CHUNK_SIZE {
                for x in 0..CHUNK_SIZE {
                    chunk.set_block(x, y, z, block);
                }
            }
        }
    }
}

/// Position-indexed chunk storage.
pub trait ChunkStore {
    /// Look up the chunk at `position`, generating it first if absent.
    fn get_or_create(&mut self, position: ChunkPosition) -> &Chunk;

    fn get(&self, position: ChunkPosition) -> Option<&Chunk>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory chunk store.
#[derive(Debug)]
pub struct ChunkManager<G> {
    chunks: HashMap<ChunkPosition, Chunk>,
    generator: G,
}

impl<G: TerrainGenerator> ChunkManager<G> {
    pub fn new(generator: G) -> Self {
        Self {
            chunks: HashMap::new(),
            generator,
        }
    }
}

impl<G: TerrainGenerator> ChunkStore for ChunkManager<G> {
    fn get_or_create(&mut self, position: ChunkPosition) -> &Chunk {
        let generator = &self.generator;
        self.chunks.entry(position).or_insert_with(|| {
            let mut chunk = Chunk::new(position);
            generator.fill(&mut chunk);
            debug!("Generated chunk {}", position);
            chunk
        })
    }

    fn get(&self, position: ChunkPosition) -> Option<&Chunk> {
        self.chunks.get(&position)
    }

    fn len(&self) -> usize {
        self.chunks.len()
    }
}
