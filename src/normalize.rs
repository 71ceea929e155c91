//! Turns raw recognizer text into a `CanonicalPlate`.
//!
//! The grammar is data, not code: a fixed plate length, a minimum raw length,
//! a set of positional layouts and the region codes that may open a layout.
//! Layout characters are `R` (region-code letter, positions 0 and 1 only),
//! `L` (letter), `D` (digit) and `A` (letter or digit).

use crate::error::ConfigError;
use crate::types::CanonicalPlate;
use std::collections::HashSet;

/// Old state-series format, e.g. `MH12AB1234`.
pub const STATE_SERIES_LAYOUT: &str = "RRDDLLDDDD";
/// National-series format, e.g. `22BH1234AB`.
pub const NATIONAL_SERIES_LAYOUT: &str = "DDLLDDDDLL";

pub const DEFAULT_REGION_CODES: &[&str] = &[
    "AN", "AP", "AR", "AS", "BR", "CG", "CH", "DD", "DL", "DN", "GA", "GJ", "HP", "HR", "JH", "JK",
    "KA", "KL", "LA", "LD", "MH", "ML", "MN", "MP", "MZ", "NL", "OD", "OR", "PB", "PY", "RJ", "SK",
    "TN", "TR", "TS", "UK", "UP", "WB",
];

// Pairs that the recognizer confuses in either direction; only used on the region prefix.
const REGION_CONFUSABLES: &[(char, char)] = &[
    ('0', 'O'),
    ('1', 'I'),
    ('2', 'Z'),
    ('4', 'A'),
    ('5', 'S'),
    ('6', 'G'),
    ('7', 'T'),
    ('8', 'B'),
];

// Letters read where a digit belongs.
const DIGIT_LOOKALIKES: &[(char, char)] = &[
    ('O', '0'),
    ('Q', '0'),
    ('D', '0'),
    ('I', '1'),
    ('L', '1'),
    ('S', '5'),
    ('G', '6'),
    ('B', '8'),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Region,
    Letter,
    Digit,
    Any,
}

impl Slot {
    fn accepts(self, c: char) -> bool {
        match self {
            Slot::Region | Slot::Letter => c.is_ascii_uppercase(),
            Slot::Digit => c.is_ascii_digit(),
            Slot::Any => c.is_ascii_uppercase() || c.is_ascii_digit(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    source: String,
    slots: Vec<Slot>,
}

impl Layout {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Layout {
            layout: source.to_string(),
            reason: reason.to_string(),
        };
        let slots = source
            .chars()
            .map(|c| match c {
                'R' => Ok(Slot::Region),
                'L' => Ok(Slot::Letter),
                'D' => Ok(Slot::Digit),
                'A' => Ok(Slot::Any),
                _ => Err(invalid("only R, L, D and A are allowed")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if slots.is_empty() {
            return Err(invalid("empty layout"));
        }
        let region_positions: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == Slot::Region)
            .map(|(i, _)| i)
            .collect();
        if !region_positions.is_empty() && region_positions != [0, 1] {
            return Err(invalid("R must fill exactly positions 0 and 1"));
        }
        Ok(Layout {
            source: source.to_string(),
            slots,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn has_region_prefix(&self) -> bool {
        self.slots.first() == Some(&Slot::Region)
    }
}

#[derive(Clone, Debug)]
pub struct PlateGrammar {
    length: usize,
    min_raw_length: usize,
    layouts: Vec<Layout>,
    region_codes: HashSet<String>,
}

impl PlateGrammar {
    pub fn new(
        length: usize,
        min_raw_length: usize,
        layouts: Vec<Layout>,
        region_codes: HashSet<String>,
    ) -> Result<Self, ConfigError> {
        if layouts.is_empty() {
            return Err(ConfigError::invalid("PLATE_LAYOUTS", "", "no layouts"));
        }
        for layout in &layouts {
            if layout.len() != length {
                return Err(ConfigError::Layout {
                    layout: layout.as_str().to_string(),
                    reason: format!("length {} differs from plate length {}", layout.len(), length),
                });
            }
        }
        Ok(PlateGrammar {
            length,
            min_raw_length,
            layouts,
            region_codes,
        })
    }

    /// Ten-character grammar with the state-series and national-series layouts.
    #[cfg(test)]
    pub fn standard() -> Result<Self, ConfigError> {
        PlateGrammar::new(
            10,
            8,
            vec![
                Layout::parse(STATE_SERIES_LAYOUT)?,
                Layout::parse(NATIONAL_SERIES_LAYOUT)?,
            ],
            DEFAULT_REGION_CODES.iter().map(|c| c.to_string()).collect(),
        )
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn layouts(&self) -> &[Layout] {
        &self.layouts
    }

    // An empty region set leaves region positions unconstrained beyond "letter".
    fn is_region(&self, prefix: &[char]) -> bool {
        if self.region_codes.is_empty() {
            return prefix.iter().all(|c| c.is_ascii_uppercase());
        }
        let code: String = prefix.iter().collect();
        self.region_codes.contains(&code)
    }

    fn matches(&self, layout: &Layout, chars: &[char]) -> bool {
        chars.len() == layout.len()
            && layout.slots.iter().zip(chars).all(|(s, c)| s.accepts(*c))
            && (!layout.has_region_prefix() || self.is_region(&chars[..2]))
    }

    fn matches_any(&self, chars: &[char]) -> bool {
        self.layouts.iter().any(|l| self.matches(l, chars))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Normalized {
    pub plate: CanonicalPlate,
    /// False when a character substitution was needed to fit the grammar.
    pub exact: bool,
}

#[derive(Clone, Debug)]
pub struct PlateNormalizer {
    grammar: PlateGrammar,
}

impl PlateNormalizer {
    pub fn new(grammar: PlateGrammar) -> Self {
        PlateNormalizer { grammar }
    }

    pub fn normalize(&self, raw: &str) -> Option<Normalized> {
        let chars: Vec<char> = raw
            .chars()
            .map(|c| c.to_ascii_uppercase())
            .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            .collect();
        if chars.len() < self.grammar.min_raw_length || chars.len() != self.grammar.length {
            return None;
        }
        if self.grammar.matches_any(&chars) {
            return Some(accept(chars, true));
        }

        let chars = self.correct_region(&chars).unwrap_or(chars);
        if self.grammar.matches_any(&chars) {
            return Some(accept(chars, false));
        }

        self.grammar.layouts.iter().find_map(|layout| {
            let substituted = substitute_digits(layout, &chars);
            if self.grammar.matches(layout, &substituted) {
                Some(accept(substituted, false))
            } else {
                None
            }
        })
    }

    /// Single substitution on the first two characters, kept only if it yields a region code.
    fn correct_region(&self, chars: &[char]) -> Option<Vec<char>> {
        if chars.len() < 2 || self.grammar.region_codes.is_empty() {
            return None;
        }
        if self.grammar.is_region(&chars[..2]) {
            return None;
        }
        for pos in 0..2 {
            for alt in confusables(chars[pos]) {
                let mut prefix = [chars[0], chars[1]];
                prefix[pos] = alt;
                if self.grammar.is_region(&prefix) {
                    let mut corrected = chars.to_vec();
                    corrected[pos] = alt;
                    return Some(corrected);
                }
            }
        }
        None
    }
}

fn accept(chars: Vec<char>, exact: bool) -> Normalized {
    Normalized {
        plate: CanonicalPlate::new_unchecked(chars.into_iter().collect()),
        exact,
    }
}

fn confusables(c: char) -> impl Iterator<Item = char> {
    REGION_CONFUSABLES.iter().filter_map(move |&(a, b)| {
        if a == c {
            Some(b)
        } else if b == c {
            Some(a)
        } else {
            None
        }
    })
}

fn substitute_digits(layout: &Layout, chars: &[char]) -> Vec<char> {
    layout
        .slots
        .iter()
        .zip(chars)
        .map(|(slot, &c)| {
            if *slot != Slot::Digit {
                return c;
            }
            DIGIT_LOOKALIKES
                .iter()
                .find(|(letter, _)| *letter == c)
                .map(|(_, digit)| *digit)
                .unwrap_or(c)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> PlateNormalizer {
        PlateNormalizer::new(PlateGrammar::standard().unwrap())
    }

    fn plate(raw: &str) -> Option<String> {
        normalizer()
            .normalize(raw)
            .map(|n| n.plate.as_str().to_string())
    }

    #[test]
    fn spaced_old_format_is_accepted() {
        let n = normalizer().normalize("M H 1 2 A B 1 2 3 4").unwrap();
        assert_eq!(n.plate.as_str(), "MH12AB1234");
        assert!(n.exact);
    }

    #[test]
    fn lowercase_and_punctuation_are_stripped() {
        assert_eq!(plate("ka-01.ab 1234").as_deref(), Some("KA01AB1234"));
    }

    #[test]
    fn trailing_letter_block_too_long_is_rejected() {
        assert_eq!(plate("WB05XYZ999"), None);
    }

    #[test]
    fn short_and_long_inputs_are_rejected() {
        assert_eq!(plate("MH12AB1"), None);
        assert_eq!(plate("MH12AB12"), None);
        assert_eq!(plate("MH12AB12345"), None);
        assert_eq!(plate(""), None);
    }

    #[test]
    fn unknown_region_is_rejected() {
        assert_eq!(plate("XX12AB1234"), None);
    }

    #[test]
    fn national_series_is_accepted() {
        assert_eq!(plate("22 BH 1234 AA").as_deref(), Some("22BH1234AA"));
    }

    #[test]
    fn region_prefix_digit_is_corrected() {
        let n = normalizer().normalize("0D02AB1234").unwrap();
        assert_eq!(n.plate.as_str(), "OD02AB1234");
        assert!(!n.exact);

        assert_eq!(plate("K401AB1234").as_deref(), Some("KA01AB1234"));
    }

    #[test]
    fn letters_in_digit_positions_are_corrected() {
        let n = normalizer().normalize("KA0IAB12S4").unwrap();
        assert_eq!(n.plate.as_str(), "KA01AB1254");
        assert!(!n.exact);
    }

    #[test]
    fn correction_does_not_touch_letter_positions() {
        // '0' where a letter belongs has no reverse table.
        assert_eq!(plate("MH12001234"), None);
    }

    #[test]
    fn normalize_is_idempotent_on_accepted_output() {
        let n = normalizer();
        for raw in [
            "M H 1 2 A B 1 2 3 4",
            "0D02AB1234",
            "K401AB1234",
            "KA0IAB12S4",
            "22bh1234aa",
            "dl 3c ab 0001",
        ] {
            if let Some(first) = n.normalize(raw) {
                let second = n.normalize(first.plate.as_str()).unwrap();
                assert_eq!(first.plate, second.plate, "input {:?}", raw);
                assert!(second.exact);
            }
        }
    }

    #[test]
    fn accepted_plates_fit_a_layout_of_grammar_length() {
        let n = normalizer();
        for raw in ["MH12AB1234", "0D02AB1234", "22BH1234AA", "KA0IAB12S4"] {
            let accepted = n.normalize(raw).unwrap();
            let chars: Vec<char> = accepted.plate.as_str().chars().collect();
            assert_eq!(chars.len(), n.grammar.length());
            assert!(n.grammar.matches_any(&chars));
        }
    }

    #[test]
    fn layouts_must_match_plate_length() {
        let short = Layout::parse("RRDDLLDDD").unwrap();
        assert!(PlateGrammar::new(10, 8, vec![short], HashSet::new()).is_err());
    }

    #[test]
    fn region_slots_only_at_start() {
        assert!(Layout::parse("DDRRDDDDLL").is_err());
        assert!(Layout::parse("RDDDLLDDDD").is_err());
        assert!(Layout::parse("XXDDLLDDDD").is_err());
    }

    #[test]
    fn empty_region_set_accepts_any_letter_prefix() {
        let grammar = PlateGrammar::new(
            10,
            8,
            vec![Layout::parse(STATE_SERIES_LAYOUT).unwrap()],
            HashSet::new(),
        )
        .unwrap();
        let n = PlateNormalizer::new(grammar);
        assert!(n.normalize("XX12AB1234").is_some());
    }
}
