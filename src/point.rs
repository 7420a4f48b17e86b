use nalgebra::{Unit, Vector3};
use std::collections::HashMap;

/// A named feature shared between images.
///
/// Created the first time any image or explicit declaration mentions the
/// name; its world direction is set once during registration and never
/// cleared. Every image referencing the name is constrained through it.
#[derive(Clone, Debug)]
pub struct StitchPoint {
    name: String,
    direction: Option<Unit<Vector3<f64>>>,
    images: Vec<usize>,
}

impl StitchPoint {
    fn new(name: String) -> Self {
        Self {
            name,
            direction: None,
            images: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// World-frame direction, once known.
    pub fn direction(&self) -> Option<&Unit<Vector3<f64>>> {
        self.direction.as_ref()
    }

    pub fn is_known(&self) -> bool {
        self.direction.is_some()
    }

    /// Indices of the images referencing this point.
    pub fn images(&self) -> &[usize] {
        &self.images
    }
}

/// Arena of stitch points indexed by name.
#[derive(Default, Debug)]
pub struct PointTable {
    points: Vec<StitchPoint>,
    by_name: HashMap<String, usize>,
}

impl PointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&StitchPoint> {
        self.by_name.get(name).map(|&i| &self.points[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &StitchPoint> {
        self.points.iter()
    }

    pub(crate) fn get_or_insert(&mut self, name: &str) -> usize {
        match self.by_name.get(name) {
            Some(&i) => i,
            None => {
                let i = self.points.len();
                self.points.push(StitchPoint::new(name.to_owned()));
                self.by_name.insert(name.to_owned(), i);
                i
            }
        }
    }

    pub(crate) fn reference(&mut self, name: &str, image: usize) {
        let i = self.get_or_insert(name);
        let images = &mut self.points[i].images;
        if !images.contains(&image) {
            images.push(image);
        }
    }

    /// Sets a point's direction; the first writer wins.
    pub(crate) fn set_direction(&mut self, name: &str, direction: Unit<Vector3<f64>>) {
        let i = self.get_or_insert(name);
        let point = &mut self.points[i];
        if point.direction.is_none() {
            point.direction = Some(direction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazily_created_and_shared() {
        let mut table = PointTable::new();
        table.reference("summit", 0);
        table.reference("summit", 2);
        table.reference("summit", 0);

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("summit").unwrap().images(), &[0, 2]);
        assert!(!table.get("summit").unwrap().is_known());
    }

    #[test]
    fn direction_set_once() {
        let mut table = PointTable::new();
        table.set_direction("summit", Unit::new_normalize(Vector3::y()));
        table.set_direction("summit", Unit::new_normalize(Vector3::x()));

        let dir = table.get("summit").unwrap().direction().unwrap();
        assert!((dir.into_inner() - Vector3::y()).norm() < 1e-12);
    }
}
