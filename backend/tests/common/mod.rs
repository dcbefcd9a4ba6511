#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;

use backend::{Document, PartitionedStore, ReviewTable};

pub const DEPARTMENTS: [&str; 3] = ["Tops", "Dresses", "Bottoms"];

pub fn review(id: usize, bucket: u8, rating: i64, department: &str) -> Document {
    let document = json!({
        "reviewId": format!("review-{id:04}"),
        "timestamp": 1_700_000_000 + id as i64,
        "randomBucket": bucket,
        "clothingId": format!("{}", 800 + id % 50),
        "age": 25 + (id % 40) as i64,
        "title": format!("Title {id}"),
        "review": format!("Review body {id}"),
        "rating": rating,
        "recommended": rating >= 4,
        "division": "General",
        "department": department,
        "class": "Knits",
    });
    serde_json::from_value(document).unwrap()
}

pub async fn table_from(reviews: Vec<Document>, page_size: usize) -> Arc<ReviewTable> {
    let table = ReviewTable::in_memory("RandomAccessIndex", page_size);
    for review in reviews {
        table.put(review).await.unwrap();
    }
    Arc::new(table)
}

/// `count` reviews dealt round-robin over all ten buckets; inside a bucket
/// ratings cycle through 1..=5 and departments through `DEPARTMENTS`.
pub fn spread(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            let round = i / 10;
            review(
                i,
                (i % 10) as u8 + 1,
                (round % 5) as i64 + 1,
                DEPARTMENTS[round % DEPARTMENTS.len()],
            )
        })
        .collect()
}
