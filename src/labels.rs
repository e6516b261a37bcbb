/// The 20 PASCAL VOC object classes, in their usual order.
pub const VOC_CLASSES: [&str; 20] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

pub const BACKGROUND: &str = "__background__";

/// Maps the detector's class ids to names.
///
/// Background is always assigned to index `0`, foreground classes follow in the order they
/// were given.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn voc() -> Self {
        Self::new(VOC_CLASSES.iter().map(|n| n.to_string()).collect())
    }

    /// Parses a comma separated list such as `"dog, cat,person"`. Empty entries are skipped.
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    /// Number of foreground classes.
    pub fn num_classes(&self) -> usize {
        self.names.len()
    }

    /// Returns the total number of model classes including the background class.
    pub fn count(&self) -> usize {
        self.names.len() + 1
    }

    pub fn name(&self, class_id: usize) -> Option<&str> {
        match class_id {
            0 => Some(BACKGROUND),
            id => self.names.get(id - 1).map(String::as_str),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}
