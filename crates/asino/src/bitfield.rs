//! Wrapper type around Bitvec.
//!
//! Bit `i` lives in byte `i / 8` under the mask `0x80 >> (i % 8)`. The
//! padding bits of the last byte are always zero after a mutation, so the raw
//! bytes can be persisted or compared as-is.
use bitvec::{order::Msb0, vec::BitVec};

type Bits = BitVec<u8, Msb0>;

/// Set bits per nibble value.
const NIBBLE_ONES: [u8; 16] = [0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4];

/// Resizable bit vector, where index = piece or block.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Bits);

impl Bitfield {
    /// Create a bitfield of `bits` length with every bit set to `val`.
    pub fn new(bits: usize, val: bool) -> Self {
        Self(Bits::repeat(val, bits))
    }

    /// Build a bitfield from raw bytes, keeping only the first `bits`.
    pub fn from_bytes(bytes: &[u8], bits: usize) -> Self {
        let mut b = Self::default();
        b.assign(bytes, bits);
        b
    }

    /// Replace the contents wholesale. If `bytes` is shorter than `bits`
    /// the missing bits are clear.
    pub fn assign(&mut self, bytes: &[u8], bits: usize) {
        let len = bits.div_ceil(8).min(bytes.len());
        let mut v = Bits::from_slice(&bytes[..len]);
        v.resize(bits, false);
        self.0 = v;
        self.clear_trailing_bits();
    }

    /// Grow or truncate to `bits`. New bits are clear.
    pub fn resize(&mut self, bits: usize) {
        self.resize_val(bits, false);
    }

    /// Grow or truncate to `bits`, filling new bits with `val`.
    pub fn resize_val(&mut self, bits: usize, val: bool) {
        self.0.resize(bits, val);
        self.clear_trailing_bits();
    }

    #[inline]
    pub fn bits(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// # Panics
    ///
    /// If `index >= self.bits()`.
    #[inline]
    pub fn get_bit(&self, index: usize) -> bool {
        self.0[index]
    }

    /// # Panics
    ///
    /// If `index >= self.bits()`.
    #[inline]
    pub fn set_bit(&mut self, index: usize) {
        self.0.set(index, true);
    }

    /// # Panics
    ///
    /// If `index >= self.bits()`.
    #[inline]
    pub fn clear_bit(&mut self, index: usize) {
        self.0.set(index, false);
    }

    pub fn set_all(&mut self) {
        self.0.fill(true);
        self.clear_trailing_bits();
    }

    pub fn clear_all(&mut self) {
        self.0.fill(false);
    }

    /// Population count.
    pub fn count(&self) -> usize {
        let bytes = self.0.as_raw_slice();
        let full = self.bits() / 8;

        let mut count: usize = bytes[..full]
            .iter()
            .map(|b| {
                (NIBBLE_ONES[(b & 0x0f) as usize] + NIBBLE_ONES[(b >> 4) as usize])
                    as usize
            })
            .sum();

        for i in full * 8..self.bits() {
            if self.get_bit(i) {
                count += 1;
            }
        }

        count
    }

    /// If every bit is set. An empty bitfield is complete.
    pub fn all(&self) -> bool {
        self.0.all()
    }

    /// Index of the lowest clear bit.
    pub fn first_clear(&self) -> Option<usize> {
        self.0.first_zero()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }

    /// Raw backing bytes, `ceil(bits / 8)` long.
    pub fn bytes(&self) -> &[u8] {
        self.0.as_raw_slice()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }

    fn clear_trailing_bits(&mut self) {
        let rem = self.bits() % 8;
        if rem == 0 {
            return;
        }
        if let Some(last) = self.0.as_raw_mut_slice().last_mut() {
            *last &= 0xffu8 << (8 - rem);
        }
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitfield({}/{} ", self.count(), self.bits())?;
        for b in self.0.iter().by_vals() {
            f.write_str(if b { "1" } else { "0" })?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trailing_clear(b: &Bitfield) -> bool {
        let rem = b.bits() % 8;
        rem == 0 || b.bytes().last().map_or(true, |l| l & (0xff >> rem) == 0)
    }

    #[test]
    fn msb_first_layout() {
        let mut bitfield = Bitfield::new(10, false);
        bitfield.set_bit(0);
        bitfield.set_bit(9);
        assert_eq!(bitfield.bytes(), &[0x80, 0x40]);

        bitfield.clear_bit(0);
        assert_eq!(bitfield.bytes(), &[0x00, 0x40]);
        assert!(bitfield.get_bit(9));
        assert!(!bitfield.get_bit(8));
    }

    #[test]
    fn new_with_value_clears_padding() {
        let bitfield = Bitfield::new(11, true);
        assert_eq!(bitfield.bytes(), &[0xff, 0xe0]);
        assert_eq!(bitfield.count(), 11);
        assert!(bitfield.all());
    }

    #[test]
    fn resize_keeps_prefix() {
        let mut bitfield = Bitfield::new(5, false);
        bitfield.set_bit(1);
        bitfield.set_bit(4);

        bitfield.resize(20);
        assert_eq!(bitfield.bits(), 20);
        assert_eq!(bitfield.count(), 2);
        assert!(bitfield.get_bit(1) && bitfield.get_bit(4));

        bitfield.resize_val(27, true);
        assert_eq!(bitfield.count(), 9);
        assert!(trailing_clear(&bitfield));

        bitfield.resize(3);
        assert_eq!(bitfield.bits(), 3);
        assert_eq!(bitfield.count(), 1);
        assert_eq!(bitfield.bytes(), &[0x40]);
    }

    #[test]
    fn shrink_then_grow_does_not_resurrect_bits() {
        let mut bitfield = Bitfield::new(8, true);
        bitfield.resize(2);
        assert_eq!(bitfield.bytes(), &[0xc0]);
        bitfield.resize(8);
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn set_and_clear_all() {
        let mut bitfield = Bitfield::new(13, false);
        bitfield.set_all();
        assert_eq!(bitfield.count(), 13);
        assert!(trailing_clear(&bitfield));

        bitfield.clear_all();
        assert_eq!(bitfield.count(), 0);
        assert_eq!(bitfield.first_clear(), Some(0));
    }

    #[test]
    fn assign_masks_padding() {
        let mut bitfield = Bitfield::default();
        bitfield.assign(&[0xff, 0xff, 0xff], 12);
        assert_eq!(bitfield.bits(), 12);
        assert_eq!(bitfield.bytes(), &[0xff, 0xf0]);
        assert_eq!(bitfield.count(), 12);

        // short input
        let bitfield = Bitfield::from_bytes(&[0x80], 16);
        assert_eq!(bitfield.bits(), 16);
        assert_eq!(bitfield.count(), 1);
    }

    #[test]
    fn count_matches_naive() {
        let bytes = [0b1011_0010, 0b0111_1111, 0b1000_0001, 0b1110_0000];
        let bitfield = Bitfield::from_bytes(&bytes, 27);
        let naive = (0..27).filter(|i| bitfield.get_bit(*i)).count();
        assert_eq!(bitfield.count(), naive);
    }

    #[test]
    fn first_clear() {
        let mut bitfield = Bitfield::new(3, true);
        assert_eq!(bitfield.first_clear(), None);
        bitfield.clear_bit(2);
        assert_eq!(bitfield.first_clear(), Some(2));
        assert_eq!(bitfield.iter_ones().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    #[should_panic]
    fn out_of_range_panics() {
        let bitfield = Bitfield::new(4, false);
        bitfield.get_bit(4);
    }
}
