//! Filter predicates evaluated against stored review documents.

use serde_json::Value;

use crate::{Document, POSITIVE_RATING_THRESHOLD};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RatingFilter {
    #[default]
    All,
    Positive,
    Negative,
}

impl RatingFilter {
    /// Unknown values fall back to `All`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" => RatingFilter::Positive,
            "negative" => RatingFilter::Negative,
            _ => RatingFilter::All,
        }
    }

    fn accepts(&self, rating: Option<i64>) -> bool {
        match (self, rating) {
            (RatingFilter::All, _) => true,
            (RatingFilter::Positive, Some(r)) => r >= POSITIVE_RATING_THRESHOLD,
            (RatingFilter::Negative, Some(r)) => r < POSITIVE_RATING_THRESHOLD,
            (_, None) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RatingClass {
    Positive,
    Negative,
}

impl RatingClass {
    pub fn of(document: &Document) -> Option<Self> {
        rating_of(document).map(|rating| {
            if rating >= POSITIVE_RATING_THRESHOLD {
                RatingClass::Positive
            } else {
                RatingClass::Negative
            }
        })
    }
}

/// Conjunction of an optional rating class and an optional department match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterPredicate {
    pub rating: RatingFilter,
    pub department: Option<String>,
}

impl FilterPredicate {
    /// `department` of `"all"` disables the department clause.
    pub fn new(rating: RatingFilter, department: &str) -> Self {
        let department = match department.trim() {
            "" | "all" => None,
            value => Some(value.to_string()),
        };
        Self { rating, department }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_unfiltered(&self) -> bool {
        self.rating == RatingFilter::All && self.department.is_none()
    }

    pub fn matches(&self, document: &Document) -> bool {
        if !self.rating.accepts(rating_of(document)) {
            return false;
        }
        match &self.department {
            Some(wanted) => department_of(document) == Some(wanted.as_str()),
            None => true,
        }
    }
}

/// Rating as an integer, truncating float-typed values.
pub fn rating_of(document: &Document) -> Option<i64> {
    match document.get("rating")? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        _ => None,
    }
}

pub fn department_of(document: &Document) -> Option<&str> {
    document.get("department").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parse_is_lenient() {
        assert_eq!(RatingFilter::parse("positive"), RatingFilter::Positive);
        assert_eq!(RatingFilter::parse(" Negative "), RatingFilter::Negative);
        assert_eq!(RatingFilter::parse("all"), RatingFilter::All);
        assert_eq!(RatingFilter::parse("five-stars"), RatingFilter::All);
    }

    #[test]
    fn rating_threshold_splits_classes() {
        let positive = FilterPredicate::new(RatingFilter::Positive, "all");
        let negative = FilterPredicate::new(RatingFilter::Negative, "all");

        let four = doc(json!({"rating": 4}));
        let three = doc(json!({"rating": 3.0}));
        let unrated = doc(json!({"title": "no rating"}));

        assert!(positive.matches(&four));
        assert!(!negative.matches(&four));
        assert!(negative.matches(&three));
        assert!(!positive.matches(&three));
        assert!(!positive.matches(&unrated));
        assert!(!negative.matches(&unrated));
        assert!(FilterPredicate::all().matches(&unrated));
    }

    #[test]
    fn department_is_exact_match() {
        let tops = FilterPredicate::new(RatingFilter::All, "Tops");
        assert!(tops.matches(&doc(json!({"department": "Tops", "rating": 1}))));
        assert!(!tops.matches(&doc(json!({"department": "tops"}))));
        assert!(!tops.matches(&doc(json!({"rating": 5}))));
        assert!(FilterPredicate::new(RatingFilter::All, "all").is_unfiltered());
    }

    #[test]
    fn float_ratings_truncate() {
        assert_eq!(rating_of(&doc(json!({"rating": 3.9}))), Some(3));
        assert_eq!(
            RatingClass::of(&doc(json!({"rating": 4.2}))),
            Some(RatingClass::Positive)
        );
        assert_eq!(RatingClass::of(&doc(json!({"rating": "5"}))), None);
    }
}
