mod route_command;

pub use route_command::RouteCommandBackend;
