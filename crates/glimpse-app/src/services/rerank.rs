//! Metadata-aware re-ranking of vector candidates.

use glimpse_server::{FilterSpec, ProductMatch};

const BRAND_BOOST: f64 = 0.10;
const COLOR_BOOST: f64 = 0.05;
const CATEGORY_BOOST: f64 = 0.05;
const PRICE_BOOST: f64 = 0.10;
pub const MAX_BOOST: f64 = 0.15;
const SIMILARITY_WEIGHT: f64 = 0.85;
// Weights the already-capped boost, so metadata contributes at most 0.0225.
const BOOST_WEIGHT: f64 = 0.15;

/// Additive metadata boost for one candidate, capped at `MAX_BOOST`.
pub fn meta_boost(candidate: &ProductMatch, filters: &FilterSpec) -> f64 {
    let mut boost = 0.0;
    if matches_any(candidate.brand.as_deref(), &filters.brands) {
        boost += BRAND_BOOST;
    }
    if matches_any(candidate.color.as_deref(), &filters.colors) {
        boost += COLOR_BOOST;
    }
    if matches_any(candidate.category.as_deref(), &filters.categories) {
        boost += CATEGORY_BOOST;
    }
    if filters.has_price_range()
        && let Some(price) = candidate.price
        && filters.price_in_range(price)
    {
        boost += PRICE_BOOST;
    }
    boost.min(MAX_BOOST)
}

fn matches_any(value: Option<&str>, wanted: &[String]) -> bool {
    match value {
        Some(value) if !value.is_empty() => wanted.iter().any(|w| w == value),
        _ => false,
    }
}

/// Blend similarity with metadata boosts and keep the best `limit` matches.
///
/// Without filters the backend order is kept and `final_score == score`.
/// Returns whether re-ranking ran.
pub fn rank(candidates: &mut Vec<ProductMatch>, filters: &FilterSpec, limit: usize) -> bool {
    let filtered = filters.has_any_filter();
    if filtered {
        for candidate in candidates.iter_mut() {
            candidate.final_score =
                SIMILARITY_WEIGHT * candidate.score + BOOST_WEIGHT * meta_boost(candidate, filters);
        }
        // `sort_by` is stable: equal scores keep backend order.
        candidates.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    } else {
        for candidate in candidates.iter_mut() {
            candidate.final_score = candidate.score;
        }
    }
    candidates.truncate(limit);
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, score: f64) -> ProductMatch {
        ProductMatch {
            id: id.to_string(),
            title: id.to_string(),
            price: None,
            brand: None,
            color: None,
            category: None,
            image_url: None,
            score,
            final_score: score,
        }
    }

    fn branded(id: &str, score: f64, brand: &str) -> ProductMatch {
        ProductMatch {
            brand: Some(brand.to_string()),
            ..product(id, score)
        }
    }

    fn nike() -> FilterSpec {
        FilterSpec {
            brands: vec!["Nike".to_string()],
            ..FilterSpec::default()
        }
    }

    #[test]
    fn boost_is_capped_for_every_combination() {
        let full = ProductMatch {
            price: Some(50.0),
            brand: Some("Nike".into()),
            color: Some("red".into()),
            category: Some("shoes".into()),
            ..product("all", 0.5)
        };
        for mask in 0..16_u8 {
            let filters = FilterSpec {
                brands: if mask & 1 != 0 { vec!["Nike".into()] } else { vec![] },
                colors: if mask & 2 != 0 { vec!["red".into()] } else { vec![] },
                categories: if mask & 4 != 0 { vec!["shoes".into()] } else { vec![] },
                price_min: if mask & 8 != 0 { Some(10.0) } else { None },
                price_max: None,
            };
            let boost = meta_boost(&full, &filters);
            assert!(boost <= MAX_BOOST + f64::EPSILON, "mask {mask} gave {boost}");
        }
    }

    #[test]
    fn brand_match_adds_weighted_boost() {
        let mut candidates = vec![branded("a", 0.80, "Nike"), branded("b", 0.81, "Adidas")];
        let ran = rank(&mut candidates, &nike(), 24);
        assert!(ran);
        let a = candidates.iter().find(|c| c.id == "a").expect("a kept");
        let b = candidates.iter().find(|c| c.id == "b").expect("b kept");
        assert!((a.final_score - (0.85 * 0.80 + 0.015)).abs() < 1e-9);
        assert!((b.final_score - 0.85 * 0.81).abs() < 1e-9);
        assert_eq!(candidates[0].id, "a");
    }

    #[test]
    fn missing_attributes_never_match() {
        let filters = FilterSpec {
            colors: vec!["red".into()],
            price_max: Some(100.0),
            ..FilterSpec::default()
        };
        assert_eq!(meta_boost(&product("bare", 0.9), &filters), 0.0);
    }

    #[test]
    fn unfiltered_rank_keeps_order_and_scores() {
        let mut candidates: Vec<ProductMatch> =
            (0..48).map(|i| product(&format!("p{i}"), 1.0 - i as f64 / 100.0)).collect();
        let ran = rank(&mut candidates, &FilterSpec::default(), 24);
        assert!(!ran);
        assert_eq!(candidates.len(), 24);
        assert_eq!(candidates[0].id, "p0");
        assert!(candidates.iter().all(|c| c.final_score == c.score));
    }

    #[test]
    fn ties_keep_backend_order() {
        let mut candidates = vec![
            branded("first", 0.5, "Puma"),
            branded("second", 0.5, "Puma"),
            branded("third", 0.5, "Puma"),
        ];
        rank(&mut candidates, &nike(), 24);
        let ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn reranking_is_idempotent() {
        let mut once = vec![
            branded("a", 0.70, "Nike"),
            branded("b", 0.71, "Puma"),
            branded("c", 0.69, "Nike"),
        ];
        rank(&mut once, &nike(), 24);
        let mut twice = once.clone();
        rank(&mut twice, &nike(), 24);
        assert_eq!(once, twice);
    }
}
