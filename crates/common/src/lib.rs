// fanout-common: wire protocol shared by the fan-out relay and its clients.

pub mod protocol;
