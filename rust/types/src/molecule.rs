//! Molecules are the unit of cell content: a 32-bit integer packing a type
//! tag into the high nibble and a signed value into the low 28 bits. The
//! mask constants are part of the wire format and must not change.

/// Bit layout of a packed molecule.
pub const MOLECULE_TYPE_SHIFT: u32 = 28;
pub const MOLECULE_TYPE_MASK: u32 = 0xF000_0000;
pub const MOLECULE_VALUE_MASK: u32 = 0x0FFF_FFFF;

/// The inclusive range of values a molecule can carry.
pub const MOLECULE_VALUE_MIN: i32 = -(1 << 27);
pub const MOLECULE_VALUE_MAX: i32 = (1 << 27) - 1;

/// Known molecule type tags.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MoleculeType {
    Code = 0,
    Data = 1,
    Energy = 2,
    Structure = 3,
    Label = 4,
}

impl MoleculeType {
    pub fn from_tag(tag: u8) -> Option<MoleculeType> {
        match tag {
            0 => Some(MoleculeType::Code),
            1 => Some(MoleculeType::Data),
            2 => Some(MoleculeType::Energy),
            3 => Some(MoleculeType::Structure),
            4 => Some(MoleculeType::Label),
            _ => None,
        }
    }
}

/// A packed molecule. The all-zero molecule is "empty" by convention; a cell
/// is empty iff its molecule is zero and its owner id is zero.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Molecule(pub i32);

impl Molecule {
    pub const EMPTY: Molecule = Molecule(0);

    /// Pack a type tag and a signed value. Values outside
    /// [`MOLECULE_VALUE_MIN`, `MOLECULE_VALUE_MAX`] are truncated to 28 bits.
    pub fn pack(molecule_type: MoleculeType, value: i32) -> Molecule {
        let tag = ((molecule_type as u32) << MOLECULE_TYPE_SHIFT) & MOLECULE_TYPE_MASK;
        let value = (value as u32) & MOLECULE_VALUE_MASK;
        Molecule((tag | value) as i32)
    }

    pub fn type_tag(&self) -> u8 {
        (((self.0 as u32) & MOLECULE_TYPE_MASK) >> MOLECULE_TYPE_SHIFT) as u8
    }

    pub fn molecule_type(&self) -> Option<MoleculeType> {
        MoleculeType::from_tag(self.type_tag())
    }

    /// The signed 28-bit value, sign-extended to i32.
    pub fn value(&self) -> i32 {
        let raw = (self.0 as u32) & MOLECULE_VALUE_MASK;
        // Sign-extend from bit 27.
        ((raw << 4) as i32) >> 4
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl From<i32> for Molecule {
    fn from(raw: i32) -> Self {
        Molecule(raw)
    }
}

impl From<Molecule> for i32 {
    fn from(molecule: Molecule) -> Self {
        molecule.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trips_positive_values() {
        let m = Molecule::pack(MoleculeType::Energy, 1234);
        assert_eq!(m.molecule_type(), Some(MoleculeType::Energy));
        assert_eq!(m.value(), 1234);
    }

    #[test]
    fn pack_round_trips_negative_values() {
        let m = Molecule::pack(MoleculeType::Data, -77);
        assert_eq!(m.molecule_type(), Some(MoleculeType::Data));
        assert_eq!(m.value(), -77);
    }

    #[test]
    fn value_extremes_round_trip() {
        for value in [MOLECULE_VALUE_MIN, MOLECULE_VALUE_MAX, 0, -1, 1] {
            let m = Molecule::pack(MoleculeType::Code, value);
            assert_eq!(m.value(), value, "value {} did not round trip", value);
        }
    }

    #[test]
    fn code_zero_is_empty() {
        // CODE:0 packs to the all-zero molecule, which is the empty cell
        // sentinel. Producers rely on this equivalence.
        let m = Molecule::pack(MoleculeType::Code, 0);
        assert!(m.is_empty());
    }

    #[test]
    fn unknown_tag_is_none() {
        let m = Molecule((0xF000_0000u32) as i32);
        assert_eq!(m.molecule_type(), None);
        assert_eq!(m.type_tag(), 0xF);
    }
}
