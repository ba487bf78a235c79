use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Print an underlined section header.
pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_path_does_not_exist() {
        let path = std::env::temp_dir().join("readmission-features-no-such-file");
        assert!(!path_exists(&path).unwrap());
        assert!(path_exists(&std::env::temp_dir()).unwrap());
    }
}
