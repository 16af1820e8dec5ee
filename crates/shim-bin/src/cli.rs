//! Hand-rolled single-dash flag parsing, matching the historical
//! containerd-shim CLI convention (`-namespace`, `-id`, ...) rather than
//! the GNU double-dash style `shim-monitor` uses — containerd invokes
//! this binary directly and expects that exact flag shape.

#[derive(Debug, Default)]
pub struct Args {
    pub namespace: String,
    pub address: String,
    pub publish_binary: String,
    pub id: String,
    pub socket: String,
    pub bundle: String,
    pub debug: bool,
}

pub fn parse(raw: &[String]) -> Args {
    let mut args = Args::default();
    let mut iter = raw.iter().peekable();
    while let Some(flag) = iter.next() {
        let value = |iter: &mut std::iter::Peekable<std::slice::Iter<String>>| {
            iter.next().cloned().unwrap_or_default()
        };
        match flag.as_str() {
            "-namespace" => args.namespace = value(&mut iter),
            "-address" => args.address = value(&mut iter),
            "-publish-binary" => args.publish_binary = value(&mut iter),
            "-id" => args.id = value(&mut iter),
            "-socket" => args.socket = value(&mut iter),
            "-bundle" => args.bundle = value(&mut iter),
            "-debug" => args.debug = true,
            _ => {}
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_single_dash_flags() {
        let raw: Vec<String> = [
            "-namespace", "k8s.io", "-id", "sbx1", "-address", "/run/containerd/containerd.sock", "-debug",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let args = parse(&raw);
        assert_eq!(args.namespace, "k8s.io");
        assert_eq!(args.id, "sbx1");
        assert_eq!(args.address, "/run/containerd/containerd.sock");
        assert!(args.debug);
    }

    #[test]
    fn unknown_flags_are_ignored() {
        let raw: Vec<String> = ["-bogus", "value", "-id", "c1"].into_iter().map(String::from).collect();
        let args = parse(&raw);
        assert_eq!(args.id, "c1");
    }
}
