use common_types::Category;

/// Communities searched for each category, joined with `+` the way the
/// source's multi-community syntax expects.
pub fn communities_for(category: Category) -> &'static str {
    match category {
        Category::Technology => "technology+Futurology+programming+gadgets+techsupport",
        Category::BusinessFinance => "wallstreetbets+investing+finance+personalfinance+entrepreneur",
        Category::PoliticsWorldAffairs => {
            "politics+worldnews+geopolitics+PoliticalHumor+PoliticalDiscussion"
        }
        Category::EntertainmentPopCulture => "movies+television+popculturechat+music",
        Category::HealthScience => "science+askscience+health+nutrition+medicine",
        Category::Sports => "sports+nba+nfl+soccer+baseball",
        Category::LifestyleSociety => {
            "relationships+selfimprovement+lifeprotips+socialskills+relationship_advice"
        }
        Category::MemesInternetTrends => "memes+dankmemes+me_irl+OutOfTheLoop+PoliticalHumor",
        Category::CrimeLaw => "legaladvice+TrueCrime+law+CrimeScene",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_maps_to_communities() {
        for category in Category::ALL {
            assert!(!communities_for(category).is_empty());
        }
    }
}
