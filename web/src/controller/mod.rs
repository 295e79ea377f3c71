pub(crate) mod health_check_controller;
pub(crate) mod vipps_controller;
