pub mod conv2d_norm;
pub mod separable_conv;
pub mod stage;
