/// Errors produced while building or running the detection head.
///
/// `Configuration` is only ever returned at construction time. Everything else is scoped to a
/// single image: the batch entry points report it in that image's slot and keep going.
#[derive(Debug, thiserror::Error)]
pub enum RFCNError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("image {image} has no proposals")]
    DegenerateInput { image: usize },

    #[error("score map has {channels} channels, which does not fit {cells} position-sensitive cells")]
    ChannelMismatch { channels: usize, cells: usize },

    #[error("got {features} feature maps but {proposals} proposal sets")]
    BatchMismatch { features: usize, proposals: usize },

    #[error("batch index {index} does not name one of {images} images")]
    BatchIndex { index: f32, images: usize },

    #[error("expected {expected} values per region, got {got}")]
    ScoreWidth { expected: usize, got: usize },

    #[error("non-finite values found in {0}")]
    NonFinite(&'static str),

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<burn::tensor::DataError> for RFCNError {
    fn from(err: burn::tensor::DataError) -> Self {
        RFCNError::TensorData(format!("{err:?}"))
    }
}
