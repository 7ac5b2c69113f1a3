pub mod assignments;
pub mod backup;
pub mod categories;
pub mod core;
pub mod courses;
pub mod grades;
pub mod settings;
pub mod terms;
