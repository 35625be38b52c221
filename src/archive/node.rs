use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use crate::error::PatchError;

/// 成员在所属容器中的定位信息，仅供容器内部解包时使用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberData {
    /// tar 成员头在归档流中的偏移
    Tar { position: u64 },
    /// zip 中央目录中的序号
    Zip { index: usize },
    /// 目录树中的实际路径
    Fs { path: PathBuf },
    /// 归档中没有显式存储、由嵌套路径推导出的目录
    Synthesized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
    Symlink(PathBuf),
}

/// 权限、属主与修改时间
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub permissions: u32,
    pub owner_name: Option<String>,
    pub owner_id: u32,
    pub group_name: Option<String>,
    pub group_id: u32,
    pub mtime: u64,
}

impl Attributes {
    pub fn with_permissions(permissions: u32) -> Self {
        Self {
            permissions,
            ..Self::default()
        }
    }
}

/// 一个文件、目录或符号链接的元数据
///
/// 目录节点按遇到的顺序分别保存文件子项和子目录。根节点没有名字。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataNode {
    pub name: Option<String>,
    pub kind: NodeKind,
    pub attrs: Attributes,
    pub data: MemberData,
    pub files: Vec<MetadataNode>,
    pub dirs: Vec<MetadataNode>,
}

impl MetadataNode {
    pub fn root(attrs: Attributes) -> Self {
        Self::dir(None::<String>, MemberData::Synthesized, attrs)
    }

    pub fn dir(name: Option<impl Into<String>>, data: MemberData, attrs: Attributes) -> Self {
        Self {
            name: name.map(Into::into),
            kind: NodeKind::Dir,
            attrs,
            data,
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    /// 文件叶子；给出 `link_target` 时为符号链接
    pub fn file(
        name: impl Into<String>,
        data: MemberData,
        attrs: Attributes,
        link_target: Option<PathBuf>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            kind: link_target.map_or(NodeKind::File, NodeKind::Symlink),
            attrs,
            data,
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink(_))
    }

    pub fn link_target(&self) -> Option<&Path> {
        match &self.kind {
            NodeKind::Symlink(target) => Some(target),
            _ => None,
        }
    }

    pub fn permissions(&self) -> u32 {
        self.attrs.permissions
    }

    /// 追加一个文件叶子并返回它
    pub fn add_file(
        &mut self,
        name: impl Into<String>,
        data: MemberData,
        attrs: Attributes,
        link_target: Option<PathBuf>,
    ) -> Result<&mut MetadataNode> {
        self.ensure_dir()?;
        self.files
            .push(MetadataNode::file(name, data, attrs, link_target));
        let last = self.files.len() - 1;
        Ok(&mut self.files[last])
    }

    /// 追加一棵已经构建好的子目录树
    pub fn add_subdir(&mut self, node: MetadataNode) -> Result<&mut MetadataNode> {
        self.ensure_dir()?;
        if !node.is_dir() {
            return Err(PatchError::InvalidNode(format!(
                "{:?} 不是目录，不能作为子目录添加",
                node.name
            ))
            .into());
        }
        self.dirs.push(node);
        let last = self.dirs.len() - 1;
        Ok(&mut self.dirs[last])
    }

    fn ensure_dir(&self) -> Result<()> {
        if self.is_dir() {
            Ok(())
        } else {
            Err(PatchError::InvalidNode(format!("{:?} 不是目录，不能添加子项", self.name)).into())
        }
    }
}

/// 容器的缓存索引：规范化相对路径 -> 节点，按遍历顺序排列
///
/// 根节点单独保存，对外以 `None` 作为键。
#[derive(Debug, Clone)]
pub struct Listing {
    root: MetadataNode,
    entries: Vec<(String, MetadataNode)>,
    lookup: HashMap<String, usize>,
    tree: OnceLock<MetadataNode>,
}

impl PartialEq for Listing {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.entries == other.entries
    }
}

impl Listing {
    pub(crate) fn new(root: MetadataNode) -> Self {
        Self {
            root,
            entries: Vec::new(),
            lookup: HashMap::new(),
            tree: OnceLock::new(),
        }
    }

    /// 同名成员出现多次时保留首次出现的位置，内容以最后一次为准
    pub(crate) fn insert(&mut self, key: String, node: MetadataNode) {
        match self.lookup.get(&key) {
            Some(&index) => self.entries[index].1 = node,
            None => {
                self.lookup.insert(key.clone(), self.entries.len());
                self.entries.push((key, node));
            }
        }
    }

    /// 为只隐含在嵌套路径中的目录补充条目，追加在所有显式成员之后
    pub(crate) fn synthesize_parents(&mut self) {
        let mut missing = BTreeSet::new();
        for (key, _) in &self.entries {
            let mut parent = parent_key(key);
            while let Some(dir) = parent {
                if !self.lookup.contains_key(dir) {
                    missing.insert(dir.to_string());
                }
                parent = parent_key(dir);
            }
        }

        for key in missing {
            let name = file_name_of(&key).to_string();
            let node = MetadataNode::dir(
                Some(name),
                MemberData::Synthesized,
                Attributes::with_permissions(0o755),
            );
            self.insert(key, node);
        }
    }

    pub fn root(&self) -> &MetadataNode {
        &self.root
    }

    pub fn get(&self, key: Option<&str>) -> Option<&MetadataNode> {
        match key {
            None => Some(&self.root),
            Some(key) => self.lookup.get(key).map(|&index| &self.entries[index].1),
        }
    }

    pub fn contains(&self, key: Option<&str>) -> bool {
        self.get(key).is_some()
    }

    /// 按遍历顺序迭代，根节点 (`None`) 在最前
    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, &MetadataNode)> {
        std::iter::once((None, &self.root)).chain(
            self.entries
                .iter()
                .map(|(key, node)| (Some(key.as_str()), node)),
        )
    }

    /// 不含根节点的成员
    pub fn members(&self) -> impl Iterator<Item = (&str, &MetadataNode)> {
        self.entries.iter().map(|(key, node)| (key.as_str(), node))
    }

    pub fn keys(&self) -> impl Iterator<Item = Option<&str>> {
        self.iter().map(|(key, _)| key)
    }

    /// 根目录下的直接子项
    pub fn top_level(&self) -> impl Iterator<Item = &str> {
        self.members()
            .map(|(key, _)| key)
            .filter(|key| !key.contains('/'))
    }

    /// 成员数，不含根节点
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 没有任何成员时为真，根节点总是存在
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 由扁平索引构建的嵌套目录树
    pub fn tree(&self) -> &MetadataNode {
        self.tree.get_or_init(|| {
            let mut children: HashMap<Option<&str>, Vec<usize>> = HashMap::new();
            for (index, (key, _)) in self.entries.iter().enumerate() {
                children.entry(parent_key(key)).or_default().push(index);
            }
            self.build_node(self.root.clone(), None, &children)
        })
    }

    fn build_node<'a>(
        &'a self,
        mut node: MetadataNode,
        key: Option<&'a str>,
        children: &HashMap<Option<&'a str>, Vec<usize>>,
    ) -> MetadataNode {
        for &index in children.get(&key).into_iter().flatten() {
            let (child_key, child) = &self.entries[index];
            if child.is_dir() {
                node.dirs
                    .push(self.build_node(child.clone(), Some(child_key.as_str()), children));
            } else {
                node.files.push(child.clone());
            }
        }
        node
    }
}

/// 将归档内路径规范化为索引键；根目录返回 `None`
///
/// 去掉 `./` 前缀和结尾的 `/`，含有 `..` 的路径视为非法。
pub fn normalize_key(path: &Path) -> Option<Option<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }

    if parts.is_empty() {
        Some(None)
    } else {
        Some(Some(parts.join("/")))
    }
}

pub(crate) fn parent_key(key: &str) -> Option<&str> {
    key.rsplit_once('/').map(|(parent, _)| parent)
}

pub(crate) fn file_name_of(key: &str) -> &str {
    key.rsplit_once('/').map_or(key, |(_, name)| name)
}

/// 判断 `key` 是否为 `member` 本身或位于其目录之下；`member` 为 `None` 时匹配全部
pub(crate) fn is_within(key: &str, member: Option<&str>) -> bool {
    match member {
        None => true,
        Some(member) => {
            key == member
                || (key.len() > member.len()
                    && key.starts_with(member)
                    && key.as_bytes()[member.len()] == b'/')
        }
    }
}
