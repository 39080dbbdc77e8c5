//! Concrete model variants.

pub mod centroid;
pub mod logistic;

pub use centroid::CentroidClassifier;
pub use logistic::LogisticRegression;
