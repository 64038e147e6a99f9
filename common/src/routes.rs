pub const ROUTE_STATUS: &str = "/data";
pub const ROUTE_SWITCH: &str = "/switch/{n}";
pub const ROUTE_CONFIG: &str = "/api/config";

pub fn switch_path(socket: u8) -> String {
    format!("/switch/{socket}")
}

/// Parses the `{n}` segment of a switch path such as `/switch/2`.
pub fn parse_switch_path(path: &str) -> Option<u8> {
    path.strip_prefix("/switch/")?
        .trim_end_matches('/')
        .parse()
        .ok()
}
