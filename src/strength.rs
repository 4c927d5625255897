//! Password strength scoring.

use std::fmt;

const SPECIALS: &str = "!@#$%^&*()_+-=[]{}|;:',.<>?/~`";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StrengthTier {
    Casual,
    Professional,
    MilitaryGrade,
}

impl StrengthTier {
    pub fn for_score(score: u8) -> Self {
        match score {
            70.. => StrengthTier::MilitaryGrade,
            40.. => StrengthTier::Professional,
            _ => StrengthTier::Casual,
        }
    }
}

impl fmt::Display for StrengthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrengthTier::Casual => "Casual",
            StrengthTier::Professional => "Professional",
            StrengthTier::MilitaryGrade => "Military Grade",
        })
    }
}

/// Score a password from 0 to 100 on length and character variety.
///
/// Length of at least 8, 12 and 16 characters adds 20, 15 and 10. Each
/// class present adds: uppercase 15, lowercase 10, digit 10, special 15.
/// Three or more classes add a further 5.
pub fn password_strength(password: &str) -> u8 {
    let len = password.chars().count();
    let mut score = 0u32;
    if len >= 8 {
        score += 20;
    }
    if len >= 12 {
        score += 15;
    }
    if len >= 16 {
        score += 10;
    }

    let classes = [
        (password.chars().any(char::is_uppercase), 15),
        (password.chars().any(char::is_lowercase), 10),
        (password.chars().any(char::is_numeric), 10),
        (password.chars().any(|c| SPECIALS.contains(c)), 15),
    ];
    let mut present = 0;
    for (has, points) in classes {
        if has {
            score += points;
            present += 1;
        }
    }
    if present >= 3 {
        score += 5;
    }

    score.min(100) as u8
}
