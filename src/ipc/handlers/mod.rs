pub mod assignments;
pub mod attendance;
pub mod auth_accounts;
pub mod classes;
pub mod core;
pub mod exams;
pub mod leave;
pub mod media;
pub mod notices;
pub mod schedules;
pub mod schools;
pub mod students;
pub mod subjects;
pub mod teachers;
