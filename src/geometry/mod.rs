//! Geometry utilities: rigid and similarity transforms, SO(3) helpers,
//! triangulation primitives.

pub mod rigid3;
pub mod sim3;
pub mod so3;
pub mod triangulation;

pub use rigid3::Rigid3d;
pub use sim3::Sim3d;
pub use so3::{project_to_rotation, retract_rotation, skew};
pub use triangulation::{
    calculate_angular_error, calculate_triangulation_angle, calculate_triangulation_angles,
    has_point_positive_depth, median, percentile, triangulate_multi_view_point, triangulate_point,
};
