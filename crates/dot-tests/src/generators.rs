//! Deterministic chain generators for integration tests.

use dot_types::{blake2b_256, BlockData, Body, Digest, Extrinsic, Hash, Header};

/// A deterministic chain of complete blocks, index = block number.
#[derive(Debug, Clone)]
pub struct Chain {
    /// Blocks `#0..=#top`.
    pub blocks: Vec<BlockData>,
}

impl Chain {
    /// Generate blocks `#0..=#top`, each with a one-extrinsic body.
    pub fn generate(top: u64) -> Self {
        Self::generate_with_justifications(top, &[])
    }

    /// Like [`Chain::generate`], attaching an opaque justification to every
    /// block number listed in `justified`.
    pub fn generate_with_justifications(top: u64, justified: &[u64]) -> Self {
        let mut blocks = Vec::with_capacity(top as usize + 1);
        let mut parent_hash = Hash::zero();
        for number in 0..=top {
            let header = Header::new(
                parent_hash,
                number,
                blake2b_256(&number.to_le_bytes()),
                Hash::zero(),
                Digest::default(),
            );
            parent_hash = header.hash();
            let justification = justified
                .contains(&number)
                .then(|| format!("justification-{number}").into_bytes());
            blocks.push(BlockData {
                hash: header.hash(),
                header: Some(header),
                body: Some(Body(vec![Extrinsic::from_bytes(
                    number.to_le_bytes().to_vec(),
                )])),
                justification,
            });
        }
        Self { blocks }
    }

    /// Header of block `#number`.
    pub fn header_at(&self, number: u64) -> Header {
        self.blocks[number as usize]
            .header
            .clone()
            .expect("generated blocks always carry a header")
    }

    /// Hash of block `#number`.
    pub fn hash_at(&self, number: u64) -> Hash {
        self.blocks[number as usize].hash
    }

    /// A side chain of `len` blocks branching off block `#branch_at`.
    ///
    /// `seed` distinguishes multiple forks from the same branch point.
    pub fn fork(&self, branch_at: u64, len: u64, seed: u8) -> Vec<BlockData> {
        let mut blocks = Vec::with_capacity(len as usize);
        let mut parent_hash = self.hash_at(branch_at);
        for offset in 1..=len {
            let number = branch_at + offset;
            let mut salt = number.to_le_bytes().to_vec();
            salt.push(seed);
            let header = Header::new(
                parent_hash,
                number,
                blake2b_256(&salt),
                Hash::from_bytes([seed; 32]),
                Digest::default(),
            );
            parent_hash = header.hash();
            blocks.push(BlockData {
                hash: header.hash(),
                header: Some(header),
                body: Some(Body(vec![Extrinsic::from_bytes(salt)])),
                justification: None,
            });
        }
        blocks
    }
}
