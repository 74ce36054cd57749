pub mod event_writer;
pub mod job_reader;
