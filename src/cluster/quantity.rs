//! Parsing of Kubernetes resource quantities as reported by metrics-server

/// Parse a CPU quantity (`"250m"`, `"1"`, `"12345n"`) into millicores
pub fn parse_cpu_millicores(value: &str) -> Option<f64> {
    let value = value.trim();
    let (number, to_millicores): (&str, fn(f64) -> f64) = match value.char_indices().last()? {
        (i, 'n') => (&value[..i], |n: f64| n / 1e6),
        (i, 'u') => (&value[..i], |n: f64| n / 1e3),
        (i, 'm') => (&value[..i], |n: f64| n),
        _ => (value, |n: f64| n * 1000.0),
    };
    number
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(to_millicores)
}

/// Parse a memory quantity (`"128Mi"`, `"1G"`, `"1048576"`) into bytes
pub fn parse_memory_bytes(value: &str) -> Option<f64> {
    const SUFFIXES: [(&str, f64); 12] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    let value = value.trim();
    let (number, scale) = SUFFIXES
        .iter()
        .find_map(|(suffix, scale)| value.strip_suffix(suffix).map(|n| (n, *scale)))
        .unwrap_or((value, 1.0));

    number
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n * scale)
}
