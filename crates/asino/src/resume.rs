//! Persisted progress of a transfer.
//!
//! Only have pieces and the finished blocks of partial pieces are stored, so
//! a resumed transfer never trusts a piece that was not verified.
use std::collections::BTreeMap;

use hashbrown::HashMap;
use speedy::{Readable, Writable};

use crate::{
    bitfield::Bitfield, error::Error, picker::PiecePicker, piece::Geometry,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Readable, Writable)]
pub struct ResumeData {
    pub piece_count: u32,
    /// Bitfield of have pieces.
    pub pieces: Vec<u8>,
    /// key: piece, value: bitfield of finished blocks.
    pub blocks: BTreeMap<u32, Vec<u8>>,
}

impl ResumeData {
    pub fn from_picker(picker: &PiecePicker) -> Self {
        let pieces = picker.get_pieces();

        Self {
            piece_count: pieces.bits() as u32,
            pieces: pieces.into_vec(),
            blocks: picker
                .get_downloaded_blocks()
                .into_iter()
                .map(|(k, v)| (k as u32, v.into_vec()))
                .collect(),
        }
    }

    /// Decode the bitfields against the geometry of the transfer, ready to
    /// be given to [`PiecePicker::apply_resume_data`].
    pub fn into_parts(
        self,
        geometry: &Geometry,
    ) -> Result<(Bitfield, HashMap<usize, Bitfield>), Error> {
        let pieces = self.piece_count as usize;

        if pieces != geometry.pieces || self.pieces.len() < pieces.div_ceil(8) {
            return Err(Error::ResumeDataInvalid);
        }

        let mut blocks = HashMap::with_capacity(self.blocks.len());

        for (piece, bytes) in self.blocks {
            let piece = piece as usize;
            if piece >= pieces {
                return Err(Error::ResumeDataInvalid);
            }
            let bits = geometry.blocks_in_piece(piece);
            if bytes.len() < bits.div_ceil(8) {
                return Err(Error::ResumeDataInvalid);
            }
            blocks.insert(piece, Bitfield::from_bytes(&bytes, bits));
        }

        Ok((Bitfield::from_bytes(&self.pieces, pieces), blocks))
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec()?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer(buf)?)
    }
}
