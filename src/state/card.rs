//! Card (board) types.
//!
//! A card is a reservable 5x5 board. Columns follow the B-I-N-G-O band
//! convention and the centre cell is the free cell.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Grid dimensions.
pub const GRID_SIZE: usize = 5;

/// Highest number that can be drawn.
pub const MAX_NUMBER: u8 = 75;

/// Width of each column band (B = 1..=15, I = 16..=30, ...).
pub const BAND_WIDTH: u8 = 15;

/// Value stored in the free cell.
pub const FREE_VALUE: u8 = 0;

/// Row/column of the free cell.
pub const FREE_CELL: (usize, usize) = (2, 2);

/// Row-major 5x5 grid of numbers.
pub type Grid = [[u8; GRID_SIZE]; GRID_SIZE];

/// Ids arrive from the server as either JSON numbers or strings.
#[doc(hidden)]
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(u64),
    Text(String),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s,
        }
    }
}

/// Stable card identifier, unique within a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "RawId")]
pub struct CardId(String);

impl CardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<RawId> for CardId {
    fn from(raw: RawId) -> Self {
        Self(raw.into())
    }
}

impl From<u64> for CardId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for CardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Serialize for CardId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Numeric ids sort numerically so "2" comes before "10".
impl Ord for CardId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for CardId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Player identifier as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "RawId")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<RawId> for UserId {
    fn from(raw: RawId) -> Self {
        Self(raw.into())
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ownership status of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    #[default]
    Available,
    Reserved,
    Sold,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::Sold => "sold",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// A reservable board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: CardId,

    pub status: CardStatus,

    /// Holder; present only when status is not available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,

    pub numbers: Grid,

    /// Server ordering token for the card's ownership fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Card {
    /// Create an available card.
    pub fn new(id: impl Into<CardId>, numbers: Grid) -> Self {
        Self {
            id: id.into(),
            status: CardStatus::Available,
            owner_id: None,
            numbers,
            version: None,
        }
    }

    pub fn with_owner(mut self, status: CardStatus, owner: UserId) -> Self {
        self.status = status;
        self.owner_id = Some(owner);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn is_available(&self) -> bool {
        self.status.is_available()
    }

    pub fn is_owned_by(&self, user: &UserId) -> bool {
        !self.is_available() && self.owner_id.as_ref() == Some(user)
    }

    /// Set status and owner together, dropping the owner for available cards.
    pub fn set_ownership(&mut self, status: CardStatus, owner: Option<UserId>) {
        self.status = status;
        self.owner_id = if status.is_available() { None } else { owner };
    }

    /// Check ownership consistency and the grid layout.
    pub fn validate(&self) -> Result<(), CardError> {
        match (self.status.is_available(), &self.owner_id) {
            (true, Some(_)) => return Err(CardError::OwnerOnAvailable(self.id.clone())),
            (false, None) => return Err(CardError::MissingOwner(self.id.clone())),
            _ => {}
        }
        validate_grid(&self.numbers)
    }

    /// Cells matched by the drawn numbers. The free cell is always matched.
    pub fn marked(&self, drawn: &[u8]) -> [[bool; GRID_SIZE]; GRID_SIZE] {
        let drawn: HashSet<u8> = drawn.iter().copied().collect();
        let mut mask = [[false; GRID_SIZE]; GRID_SIZE];
        for (row, cells) in self.numbers.iter().enumerate() {
            for (col, value) in cells.iter().enumerate() {
                mask[row][col] = *value == FREE_VALUE || drawn.contains(value);
            }
        }
        mask
    }
}

/// Inclusive number range for a column (0 = B ... 4 = O).
/// `None` past the last column.
pub fn column_band(col: usize) -> Option<(u8, u8)> {
    if col >= GRID_SIZE {
        return None;
    }
    let low = col as u8 * BAND_WIDTH + 1;
    Some((low, low + BAND_WIDTH - 1))
}

/// Letter heading a column.
pub fn column_letter(col: usize) -> char {
    ['B', 'I', 'N', 'G', 'O'].get(col).copied().unwrap_or('?')
}

/// Check the band convention, uniqueness and the single free cell.
pub fn validate_grid(grid: &Grid) -> Result<(), CardError> {
    let mut seen = HashSet::new();
    for (row, cells) in grid.iter().enumerate() {
        for (col, &value) in cells.iter().enumerate() {
            if (row, col) == FREE_CELL {
                if value != FREE_VALUE {
                    return Err(CardError::FreeCell { row, col });
                }
                continue;
            }
            if value == FREE_VALUE {
                return Err(CardError::FreeCell { row, col });
            }
            let in_band = column_band(col).is_some_and(|(low, high)| (low..=high).contains(&value));
            if !in_band {
                return Err(CardError::OutOfBand { row, col, value });
            }
            if !seen.insert(value) {
                return Err(CardError::Duplicate(value));
            }
        }
    }
    Ok(())
}

/// Card validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CardError {
    #[error("card {0} is available but has an owner")]
    OwnerOnAvailable(CardId),
    #[error("card {0} is taken but has no owner")]
    MissingOwner(CardId),
    #[error("number {value} at ({row}, {col}) is outside its column band")]
    OutOfBand { row: usize, col: usize, value: u8 },
    #[error("number {0} appears more than once")]
    Duplicate(u8),
    #[error("free cell misplaced at ({row}, {col})")]
    FreeCell { row: usize, col: usize },
}

/// Valid grid for tests: column c, row r holds `15c + r + 1 + shift`.
#[cfg(test)]
pub(crate) fn test_grid(shift: u8) -> Grid {
    let mut grid = [[0u8; GRID_SIZE]; GRID_SIZE];
    for (row, cells) in grid.iter_mut().enumerate() {
        for (col, cell) in cells.iter_mut().enumerate() {
            if (row, col) != FREE_CELL {
                *cell = column_band(col).map_or(0, |(low, _)| low) + row as u8 + shift;
            }
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_valid_grid() {
        let card = Card::new("1", test_grid(0));
        assert!(card.validate().is_ok());
        assert_eq!(card.numbers[0], [1, 16, 31, 46, 61]);
        assert_eq!(card.numbers[2][2], FREE_VALUE);
    }

    #[test]
    fn test_out_of_band() {
        let mut grid = test_grid(0);
        grid[0][0] = 20;
        assert_eq!(
            validate_grid(&grid),
            Err(CardError::OutOfBand { row: 0, col: 0, value: 20 })
        );
    }

    #[test]
    fn test_free_cell_rules() {
        let mut grid = test_grid(0);
        grid[2][2] = 33;
        assert_eq!(validate_grid(&grid), Err(CardError::FreeCell { row: 2, col: 2 }));

        let mut grid = test_grid(0);
        grid[4][4] = 0;
        assert_eq!(validate_grid(&grid), Err(CardError::FreeCell { row: 4, col: 4 }));
    }

    #[test]
    fn test_duplicate_number() {
        let mut grid = test_grid(0);
        grid[1][0] = grid[0][0];
        assert_eq!(validate_grid(&grid), Err(CardError::Duplicate(1)));
    }

    #[test]
    fn test_ownership_consistency() {
        let mut card = Card::new("3", test_grid(0));
        card.owner_id = Some(UserId::from("alice"));
        assert!(matches!(card.validate(), Err(CardError::OwnerOnAvailable(_))));

        let mut card = Card::new("3", test_grid(0));
        card.status = CardStatus::Sold;
        assert!(matches!(card.validate(), Err(CardError::MissingOwner(_))));

        // Going back to available clears the owner
        let mut card = Card::new("3", test_grid(0)).with_owner(CardStatus::Sold, "bob".into());
        card.set_ownership(CardStatus::Available, Some("bob".into()));
        assert_eq!(card.owner_id, None);
        assert!(card.validate().is_ok());
    }

    #[test]
    fn test_marked_includes_free_cell() {
        let card = Card::new("1", test_grid(0));
        let mask = card.marked(&[1, 47]);
        assert!(mask[0][0]);
        assert!(mask[1][3]);
        assert!(mask[2][2]);
        assert!(!mask[0][1]);
        let total: usize = mask.iter().flatten().filter(|m| **m).count();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_card_id_ordering() {
        let mut ids: Vec<CardId> = vec!["10".into(), "2".into(), "b".into(), "1".into()];
        ids.sort();
        let ids: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "10", "b"]);
    }

    #[test]
    fn test_deserialize_numeric_ids() {
        let json = serde_json::json!({
            "id": 7,
            "status": "sold",
            "ownerId": 12345,
            "numbers": test_grid(0),
        });
        let card: Card = serde_json::from_value(json).unwrap();
        assert_eq!(card.id, CardId::from(7u64));
        assert_eq!(card.owner_id, Some(UserId::from("12345")));
        assert_eq!(card.status, CardStatus::Sold);
        assert_eq!(card.version, None);

        let back = serde_json::to_value(&card).unwrap();
        assert_eq!(back["id"], "7");
        assert_eq!(back["ownerId"], "12345");
    }

    #[test]
    fn test_column_letters() {
        assert_eq!(column_letter(0), 'B');
        assert_eq!(column_letter(4), 'O');
        assert_eq!(column_band(0), Some((1, 15)));
        assert_eq!(column_band(2), Some((31, 45)));
        assert_eq!(column_band(4), Some((61, 75)));
    }

    #[test]
    fn test_column_band_past_grid() {
        assert_eq!(column_band(GRID_SIZE), None);
        assert_eq!(column_band(17), None);
        assert_eq!(column_band(usize::MAX), None);
        assert_eq!(column_letter(17), '?');
    }
}
