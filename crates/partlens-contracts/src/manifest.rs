use std::cmp::Ordering;
use std::path::Path;

use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One photograph of a listing with the relevance score the upstream
/// scorer assigned to it. Higher scores are tried first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedImage {
    pub link: String,
    #[serde(default)]
    pub score: f64,
}

/// One auction listing handed over by the crawler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingJob {
    pub url: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub images: Vec<RankedImage>,
}

/// Loads a listing manifest: either a bare JSON array of listings or an
/// object with a `listings` array. Every listing is normalized on the way
/// in so the driver can trust the photo order.
pub fn load_manifest(path: &Path) -> anyhow::Result<Vec<ListingJob>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading manifest {}", path.display()))?;
    let payload: Value = serde_json::from_str(&raw)
        .with_context(|| format!("manifest {} is not valid JSON", path.display()))?;

    let items = match &payload {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("listings").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => bail!(
                "manifest {} has no top-level listings array",
                path.display()
            ),
        },
        _ => bail!(
            "manifest {} must be a JSON array or an object with a listings array",
            path.display()
        ),
    };

    let mut jobs = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let job: ListingJob = serde_json::from_value(item)
            .with_context(|| format!("invalid listing entry at index {index}"))?;
        jobs.push(normalize_listing(job));
    }
    Ok(jobs)
}

/// Deduplicates photos by link (keeping the best score seen) and sorts
/// them by descending score. The sort is stable, so equal scores keep
/// their manifest order.
pub fn normalize_listing(mut job: ListingJob) -> ListingJob {
    let mut by_link: IndexMap<String, RankedImage> = IndexMap::new();
    for image in job.images.drain(..) {
        match by_link.get_mut(&image.link) {
            Some(existing) => {
                if image.score > existing.score {
                    existing.score = image.score;
                }
            }
            None => {
                by_link.insert(image.link.clone(), image);
            }
        }
    }

    let mut images: Vec<RankedImage> = by_link.into_values().collect();
    images.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    job.images = images;
    job
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{load_manifest, normalize_listing, ListingJob, RankedImage};

    fn job_with_images(images: Vec<RankedImage>) -> ListingJob {
        ListingJob {
            url: "https://example.test/listing/1".to_string(),
            price: Some("120 PLN".to_string()),
            images,
        }
    }

    #[test]
    fn load_accepts_bare_array() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("manifest.json");
        fs::write(
            &path,
            r#"[{"url": "https://example.test/a", "images": [{"link": "a.jpg", "score": 0.4}]}]"#,
        )?;

        let jobs = load_manifest(&path)?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].url, "https://example.test/a");
        assert_eq!(jobs[0].price, None);
        assert_eq!(jobs[0].images[0].link, "a.jpg");
        Ok(())
    }

    #[test]
    fn load_accepts_listings_object() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("manifest.json");
        fs::write(
            &path,
            r#"{"listings": [{"url": "https://example.test/b", "price": "99 PLN", "images": []}]}"#,
        )?;

        let jobs = load_manifest(&path)?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].price.as_deref(), Some("99 PLN"));
        Ok(())
    }

    #[test]
    fn load_rejects_other_shapes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("manifest.json");
        fs::write(&path, r#""just a string""#)?;
        assert!(load_manifest(&path).is_err());

        fs::write(&path, r#"{"items": []}"#)?;
        assert!(load_manifest(&path).is_err());
        Ok(())
    }

    #[test]
    fn normalize_sorts_by_descending_score() {
        let job = job_with_images(vec![
            RankedImage {
                link: "low.jpg".to_string(),
                score: 0.1,
            },
            RankedImage {
                link: "high.jpg".to_string(),
                score: 0.9,
            },
            RankedImage {
                link: "mid.jpg".to_string(),
                score: 0.5,
            },
        ]);

        let normalized = normalize_listing(job);
        let links: Vec<&str> = normalized
            .images
            .iter()
            .map(|image| image.link.as_str())
            .collect();
        assert_eq!(links, vec!["high.jpg", "mid.jpg", "low.jpg"]);
    }

    #[test]
    fn normalize_dedupes_links_keeping_best_score() {
        let job = job_with_images(vec![
            RankedImage {
                link: "a.jpg".to_string(),
                score: 0.2,
            },
            RankedImage {
                link: "a.jpg".to_string(),
                score: 0.7,
            },
            RankedImage {
                link: "b.jpg".to_string(),
                score: 0.5,
            },
        ]);

        let normalized = normalize_listing(job);
        assert_eq!(normalized.images.len(), 2);
        assert_eq!(normalized.images[0].link, "a.jpg");
        assert_eq!(normalized.images[0].score, 0.7);
    }

    #[test]
    fn normalize_keeps_manifest_order_for_equal_scores() {
        let job = job_with_images(vec![
            RankedImage {
                link: "first.jpg".to_string(),
                score: 0.5,
            },
            RankedImage {
                link: "second.jpg".to_string(),
                score: 0.5,
            },
        ]);

        let normalized = normalize_listing(job);
        assert_eq!(normalized.images[0].link, "first.jpg");
        assert_eq!(normalized.images[1].link, "second.jpg");
    }
}
