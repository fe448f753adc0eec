/// Which part of an array moves along an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subset {
    /// The whole array.
    All,
    /// A single element.
    Index(Vec<usize>),
}

/// Write-conflict resolution applied when several writers target one array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wcr {
    Sum,
}

/// Data-movement annotation carried by every dataflow edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memlet {
    pub data: String,
    pub subset: Subset,
    pub wcr: Option<Wcr>,
}

impl Memlet {
    /// Moves the whole of `data`.
    pub fn full(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            subset: Subset::All,
            wcr: None,
        }
    }

    /// Moves one element of `data`.
    pub fn element(data: impl Into<String>, index: Vec<usize>) -> Self {
        Self {
            data: data.into(),
            subset: Subset::Index(index),
            wcr: None,
        }
    }

    pub fn with_wcr(mut self, wcr: Wcr) -> Self {
        self.wcr = Some(wcr);
        self
    }
}

impl std::fmt::Display for Memlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subset {
            Subset::All => write!(f, "{}", self.data)?,
            Subset::Index(index) => {
                let index: Vec<String> = index.iter().map(|i| i.to_string()).collect();
                write!(f, "{}[{}]", self.data, index.join(", "))?
            }
        }
        if let Some(Wcr::Sum) = self.wcr {
            write!(f, " (+=)")?;
        }
        Ok(())
    }
}
