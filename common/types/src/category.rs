use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of topical categories a headline can be classified into.
/// Classifier output naming anything outside this set is rejected and the
/// originating headline re-queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Technology")]
    Technology,
    #[serde(rename = "Business & Finance")]
    BusinessFinance,
    #[serde(rename = "Politics & World Affairs")]
    PoliticsWorldAffairs,
    #[serde(rename = "Entertainment & Pop Culture")]
    EntertainmentPopCulture,
    #[serde(rename = "Health & Science")]
    HealthScience,
    #[serde(rename = "Sports")]
    Sports,
    #[serde(rename = "Lifestyle & Society")]
    LifestyleSociety,
    #[serde(rename = "Memes & Internet Trends")]
    MemesInternetTrends,
    #[serde(rename = "Crime & Law")]
    CrimeLaw,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Technology,
        Category::BusinessFinance,
        Category::PoliticsWorldAffairs,
        Category::EntertainmentPopCulture,
        Category::HealthScience,
        Category::Sports,
        Category::LifestyleSociety,
        Category::MemesInternetTrends,
        Category::CrimeLaw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Technology => "Technology",
            Category::BusinessFinance => "Business & Finance",
            Category::PoliticsWorldAffairs => "Politics & World Affairs",
            Category::EntertainmentPopCulture => "Entertainment & Pop Culture",
            Category::HealthScience => "Health & Science",
            Category::Sports => "Sports",
            Category::LifestyleSociety => "Lifestyle & Society",
            Category::MemesInternetTrends => "Memes & Internet Trends",
            Category::CrimeLaw => "Crime & Law",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .find(|c| c.as_str() == s.trim())
            .copied()
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown category: {}", self.0)
    }
}

impl std::error::Error for UnknownCategory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_round_trips_through_its_label() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
    }

    #[test]
    fn rejects_labels_outside_the_closed_set() {
        assert!("Gossip".parse::<Category>().is_err());
        assert!("".parse::<Category>().is_err());
    }

    #[test]
    fn serde_uses_the_display_labels() {
        let json = serde_json::to_string(&Category::BusinessFinance).unwrap();
        assert_eq!(json, "\"Business & Finance\"");
        let back: Category = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Category::BusinessFinance);
    }
}
