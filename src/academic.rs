use serde::{Deserialize, Serialize};

/// Closed list of the levels taught across the school group. Level codes in
/// stored data and requests are canonicalized through `parse`, which accepts
/// the accented/unaccented spellings found in imported rosters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchoolLevel {
    PrePrimary,
    Cp1,
    Cp2,
    Ce1,
    Ce2,
    Cm1,
    Cm2,
    Sixieme,
    Cinquieme,
    Quatrieme,
    Troisieme,
    Seconde,
    Premiere,
    Terminale,
}

impl SchoolLevel {
    pub const ALL: [SchoolLevel; 14] = [
        SchoolLevel::PrePrimary,
        SchoolLevel::Cp1,
        SchoolLevel::Cp2,
        SchoolLevel::Ce1,
        SchoolLevel::Ce2,
        SchoolLevel::Cm1,
        SchoolLevel::Cm2,
        SchoolLevel::Sixieme,
        SchoolLevel::Cinquieme,
        SchoolLevel::Quatrieme,
        SchoolLevel::Troisieme,
        SchoolLevel::Seconde,
        SchoolLevel::Premiere,
        SchoolLevel::Terminale,
    ];

    pub fn as_code(self) -> &'static str {
        match self {
            SchoolLevel::PrePrimary => "pre-primary",
            SchoolLevel::Cp1 => "cp1",
            SchoolLevel::Cp2 => "cp2",
            SchoolLevel::Ce1 => "ce1",
            SchoolLevel::Ce2 => "ce2",
            SchoolLevel::Cm1 => "cm1",
            SchoolLevel::Cm2 => "cm2",
            SchoolLevel::Sixieme => "6e",
            SchoolLevel::Cinquieme => "5e",
            SchoolLevel::Quatrieme => "4e",
            SchoolLevel::Troisieme => "3e",
            SchoolLevel::Seconde => "2nde",
            SchoolLevel::Premiere => "1ere",
            SchoolLevel::Terminale => "tle",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SchoolLevel::PrePrimary => "Pre-primary",
            SchoolLevel::Cp1 => "CP1",
            SchoolLevel::Cp2 => "CP2",
            SchoolLevel::Ce1 => "CE1",
            SchoolLevel::Ce2 => "CE2",
            SchoolLevel::Cm1 => "CM1",
            SchoolLevel::Cm2 => "CM2",
            SchoolLevel::Sixieme => "6ème",
            SchoolLevel::Cinquieme => "5ème",
            SchoolLevel::Quatrieme => "4ème",
            SchoolLevel::Troisieme => "3ème",
            SchoolLevel::Seconde => "2nde",
            SchoolLevel::Premiere => "1ère",
            SchoolLevel::Terminale => "Terminale",
        }
    }

    /// Canonicalize a level code. Imported data mixes accented and unaccented
    /// spellings for the same level ("6e", "6ème", "sixieme"); every known
    /// spelling maps to exactly one variant, anything else is `None` and must
    /// be rejected at the boundary.
    pub fn parse(raw: &str) -> Option<SchoolLevel> {
        let folded: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| match c {
                'é' | 'è' | 'ê' => 'e',
                'î' | 'ï' => 'i',
                'ô' => 'o',
                _ => c,
            })
            .collect();
        match folded.as_str() {
            "pre-primary" | "preprimary" | "maternelle" => Some(SchoolLevel::PrePrimary),
            "cp1" => Some(SchoolLevel::Cp1),
            "cp2" => Some(SchoolLevel::Cp2),
            "ce1" => Some(SchoolLevel::Ce1),
            "ce2" => Some(SchoolLevel::Ce2),
            "cm1" => Some(SchoolLevel::Cm1),
            "cm2" => Some(SchoolLevel::Cm2),
            "6e" | "6eme" | "sixieme" | "6th-grade" => Some(SchoolLevel::Sixieme),
            "5e" | "5eme" | "cinquieme" => Some(SchoolLevel::Cinquieme),
            "4e" | "4eme" | "quatrieme" => Some(SchoolLevel::Quatrieme),
            "3e" | "3eme" | "troisieme" => Some(SchoolLevel::Troisieme),
            "2nde" | "2de" | "seconde" | "2nd-year-secondary" => Some(SchoolLevel::Seconde),
            "1ere" | "1re" | "premiere" => Some(SchoolLevel::Premiere),
            "tle" | "terminale" => Some(SchoolLevel::Terminale),
            _ => None,
        }
    }
}

/// Academic term. The third term closes the year: promotion decisions are only
/// derived for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Term {
    First,
    Second,
    Third,
}

impl Term {
    pub fn from_number(n: i64) -> Option<Term> {
        match n {
            1 => Some(Term::First),
            2 => Some(Term::Second),
            3 => Some(Term::Third),
            _ => None,
        }
    }

    pub fn number(self) -> i64 {
        match self {
            Term::First => 1,
            Term::Second => 2,
            Term::Third => 3,
        }
    }

    pub fn is_year_end(self) -> bool {
        self == Term::Third
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationKind {
    Exam,
    Test,
    Homework,
    Quiz,
    Participation,
}

impl EvaluationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationKind::Exam => "exam",
            EvaluationKind::Test => "test",
            EvaluationKind::Homework => "homework",
            EvaluationKind::Quiz => "quiz",
            EvaluationKind::Participation => "participation",
        }
    }

    pub fn parse(raw: &str) -> Option<EvaluationKind> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exam" => Some(EvaluationKind::Exam),
            "test" => Some(EvaluationKind::Test),
            "homework" => Some(EvaluationKind::Homework),
            "quiz" => Some(EvaluationKind::Quiz),
            "participation" => Some(EvaluationKind::Participation),
            _ => None,
        }
    }
}

/// Evaluation lifecycle. Transitions are forward-only; `cancelled` is terminal
/// and removes the evaluation from every aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStatus {
    Planned,
    Ongoing,
    Completed,
    Cancelled,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStatus::Planned => "planned",
            EvaluationStatus::Ongoing => "ongoing",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<EvaluationStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "planned" => Some(EvaluationStatus::Planned),
            "ongoing" => Some(EvaluationStatus::Ongoing),
            "completed" => Some(EvaluationStatus::Completed),
            "cancelled" => Some(EvaluationStatus::Cancelled),
            _ => None,
        }
    }

    fn order(self) -> u8 {
        match self {
            EvaluationStatus::Planned => 0,
            EvaluationStatus::Ongoing => 1,
            EvaluationStatus::Completed => 2,
            EvaluationStatus::Cancelled => 3,
        }
    }

    pub fn can_transition_to(self, next: EvaluationStatus) -> bool {
        if self == EvaluationStatus::Cancelled {
            return false;
        }
        next.order() > self.order()
    }
}
