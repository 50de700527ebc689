pub mod hashid;
pub mod ocpp_frame;
pub mod shutdown;