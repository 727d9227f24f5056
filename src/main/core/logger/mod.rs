pub mod guest_logger;
