pub use self::signed_distance_field::SignedDistanceField;

pub mod edt;
mod signed_distance_field;
