//! Iterator helpers for per-level processing.

use std::iter::Zip;

/// Zips per-level feature maps with the per-level modules that consume them.
///
/// Every encoder owns one module per feature map level, and [`Iterator::zip`] would silently drop
/// the excess levels if a backbone returned more (or fewer) feature maps than the encoder was
/// built for. This returns an error instead.
pub fn zip_levels<A, B>(features: A, heads: B) -> anyhow::Result<Zip<A::IntoIter, B::IntoIter>>
where
    A: IntoIterator,
    B: IntoIterator,
    A::IntoIter: ExactSizeIterator,
    B::IntoIter: ExactSizeIterator,
{
    let features = features.into_iter();
    let heads = heads.into_iter();
    if features.len() != heads.len() {
        anyhow::bail!(
            "got {} feature map levels, but module was built for {}",
            features.len(),
            heads.len(),
        );
    }

    Ok(features.zip(heads))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_lengths() {
        let pairs = zip_levels([1, 2, 3], ["a", "b", "c"]).unwrap().collect::<Vec<_>>();
        assert_eq!(pairs, [(1, "a"), (2, "b"), (3, "c")]);
    }

    #[test]
    fn length_mismatch() {
        let err = zip_levels([1, 2], ["a"]).unwrap_err();
        assert!(err.to_string().contains("2 feature map levels"), "{err}");
    }
}
