mod run;
mod teardown;
mod tun;

pub use run::run;
