pub mod jobs_log;
pub mod mineduc;
