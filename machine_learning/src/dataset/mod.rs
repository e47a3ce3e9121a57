mod batch;
mod dataloader;
mod segmentation;

pub use batch::{Batch, BatchSource, Sample};
pub use dataloader::DataLoader;
pub use segmentation::{MEANS, SegmentationDataset};
