use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use zeroize::{Zeroize, Zeroizing};

/// Resolved credential values for one connection attempt, keyed by name.
///
/// Values are overwritten with zeros by [`CredentialSet::zeroize`] and again
/// when the set is dropped.
#[derive(Default, PartialEq, Eq)]
pub struct CredentialSet {
    values: HashMap<String, Vec<u8>>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        if let Some(mut old) = self.values.insert(name, value.into()) {
            old.zeroize();
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Value as UTF-8 text, lossily converted. Empty values count as absent.
    ///
    /// The copy is wiped when dropped; move the inner `String` out with
    /// `std::mem::take` to hand it to an owner that zeroizes it too.
    pub fn get_str(&self, name: &str) -> Option<Zeroizing<String>> {
        self.get(name)
            .filter(|v| !v.is_empty())
            .map(|v| Zeroizing::new(String::from_utf8_lossy(v).into_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.values.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Overwrite every value in place. Lengths are kept so callers can
    /// observe that the bytes are now all zero.
    pub fn zeroize(&mut self) {
        for value in self.values.values_mut() {
            value.as_mut_slice().zeroize();
        }
    }

    /// True when every byte of every value is zero.
    pub fn is_zeroized(&self) -> bool {
        self.values.values().all(|v| v.iter().all(|&b| b == 0))
    }
}

impl Drop for CredentialSet {
    fn drop(&mut self) {
        for value in self.values.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("names", &self.names())
            .finish()
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for CredentialSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = CredentialSet::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

/// Scoped owner of a borrowed [`CredentialSet`] that zeroizes it on drop.
///
/// The per-connection worker holds one of these for as long as the
/// credentials are live; every exit path wipes them.
pub struct CredentialGuard<'a> {
    set: &'a mut CredentialSet,
}

impl<'a> CredentialGuard<'a> {
    pub fn new(set: &'a mut CredentialSet) -> Self {
        Self { set }
    }
}

impl Deref for CredentialGuard<'_> {
    type Target = CredentialSet;

    fn deref(&self) -> &Self::Target {
        self.set
    }
}

impl DerefMut for CredentialGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.set
    }
}

impl Drop for CredentialGuard<'_> {
    fn drop(&mut self) {
        self.set.zeroize();
    }
}
