pub mod cart;
pub mod export;
pub mod pipeline;
pub mod reference;
pub mod sampler;
pub mod scene;
pub mod training;
