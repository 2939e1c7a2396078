//! MySQL `mysql_native_password` scramble.

// byte[] pass1 = md.digest(pass);
// md.reset();
// byte[] pass2 = md.digest(pass1);
// md.reset();
// md.update(seed);
// byte[] pass3 = md.digest(pass2);

pub fn scramble411(password: &[u8], seed: &[u8]) -> Box<[u8]> {
    let mut sha1 = sha1_smol::Sha1::new();
    sha1.update(password);
    let pass1 = sha1.digest().bytes();
    sha1.reset();

    sha1.update(pass1.as_ref());
    let pass2 = sha1.digest().bytes();
    sha1.reset();

    sha1.update(seed);
    sha1.update(pass2.as_ref());

    let mut pass3 = sha1.digest().bytes();

    for i in 0..pass3.len() {
        pass3[i] ^= pass1[i];
    }
    Box::from(pass3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scramble411() {
        let empty: [u8; 20] = [
            90, 11, 237, 60, 27, 229, 22, 92, 218, 4, 40, 194, 156, 74, 17, 6, 115, 219, 137, 130,
        ];
        assert_eq!(scramble411(&[], &[]).as_ref(), empty.as_slice());

        let root: [u8; 20] = [
            144, 172, 198, 232, 168, 40, 205, 38, 38, 161, 110, 255, 41, 67, 51, 175, 76, 240,
            184, 28,
        ];
        let seed = [
            37u8, 73, 41, 87, 22, 56, 51, 91, 105, 70, 125, 40, 21, 10, 18, 63, 1, 46, 29, 117,
        ];
        assert_eq!(scramble411(b"root", &seed).as_ref(), root.as_slice());
    }
}
