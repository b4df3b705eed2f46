use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Builds a `poly` request parameter from a flat coordinate list.
///
/// Four values are a bounding box `[lon1, lat1, lon2, lat2]`; a longer even
/// list is a polygon `[lat1, lon1, lat2, lon2, ...]`. The result is the
/// closed, counter-clockwise convex hull of the points.
pub fn to_region(points: &[f64]) -> Result<Vec<Coordinate>> {
    if points.len() < 4 || points.len() % 2 != 0 {
        bail!(
            "expected a bounding box [lon1, lat1, lon2, lat2] or a list of lat,lon pairs, got {} values",
            points.len()
        );
    }

    let coords: Vec<Coordinate> = if points.len() == 4 {
        let (lon1, lat1, lon2, lat2) = (points[0], points[1], points[2], points[3]);
        vec![
            Coordinate::new(lat1, lon1),
            Coordinate::new(lat1, lon2),
            Coordinate::new(lat2, lon2),
            Coordinate::new(lat2, lon1),
            Coordinate::new(lat1, lon1),
        ]
    } else {
        points
            .chunks_exact(2)
            .map(|p| Coordinate::new(p[0], p[1]))
            .collect()
    };

    Ok(counter_clockwise(convex_hull(&coords)))
}

/// Reverses `polygon` if it winds clockwise (lon as x, lat as y).
pub fn counter_clockwise(mut polygon: Vec<Coordinate>) -> Vec<Coordinate> {
    let wind: f64 = polygon
        .windows(2)
        .map(|w| (w[1].lon - w[0].lon) * (w[1].lat + w[0].lat))
        .sum();
    if wind > 0.0 {
        polygon.reverse();
    }
    polygon
}

/// Closed convex hull (monotone chain).
fn convex_hull(points: &[Coordinate]) -> Vec<Coordinate> {
    let mut pts: Vec<Coordinate> = points.to_vec();
    pts.sort_by(|a, b| a.lon.total_cmp(&b.lon).then(a.lat.total_cmp(&b.lat)));
    pts.dedup();
    if pts.len() < 3 {
        let mut out = pts.clone();
        if let Some(first) = pts.first() {
            out.push(*first);
        }
        return out;
    }

    let cross = |o: &Coordinate, a: &Coordinate, b: &Coordinate| {
        (a.lon - o.lon) * (b.lat - o.lat) - (a.lat - o.lat) * (b.lon - o.lon)
    };

    let mut lower: Vec<Coordinate> = Vec::new();
    for p in &pts {
        while lower.len() >= 2
            && cross(&lower[lower.len() - 2], &lower[lower.len() - 1], p) <= 0.0
        {
            lower.pop();
        }
        lower.push(*p);
    }
    let mut upper: Vec<Coordinate> = Vec::new();
    for p in pts.iter().rev() {
        while upper.len() >= 2
            && cross(&upper[upper.len() - 2], &upper[upper.len() - 1], p) <= 0.0
        {
            upper.pop();
        }
        upper.push(*p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    if let Some(first) = lower.first().copied() {
        lower.push(first);
    }
    lower
}
