use super::*;
use crate::state::Position;

/// Id of the date object of `yyyy-mm-dd`.
pub fn date_object_id(date: &str) -> HeartResult<ObjectId> {
    parse_date(date)?;
    Ok(ObjectId::from(
        UniqueKey::new(SmartBlockType::Date, date).marshal(),
    ))
}

fn parse_date(date: &str) -> HeartResult<(i32, u32, u32)> {
    let bad = || HeartError::bad_input(format!("invalid date key: {date}"));
    let mut parts = date.splitn(3, '-');
    let y: i32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let m: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let d: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return Err(bad());
    }
    Ok((y, m, d))
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct",
    "Nov", "Dec",
];

/// Source of an object whose document is computed, never stored.
#[derive(Debug)]
pub struct VirtualSource {
    id: ObjectId,
    space_id: SpaceId,
    key: UniqueKey,
}

impl VirtualSource {
    /// The virtual source for `id`, if `id` names a virtual object.
    pub fn for_id(space: &SpaceId, id: &ObjectId) -> HeartResult<Option<Self>> {
        if !id.starts_with('_') {
            return Ok(None);
        }
        let Ok(key) = UniqueKey::parse(id) else {
            return Ok(None);
        };
        if !key.sb_type.is_virtual() {
            return Ok(None);
        }
        if key.sb_type == SmartBlockType::Date {
            parse_date(&key.key)?;
        }
        Ok(Some(Self {
            id: id.clone(),
            space_id: space.clone(),
            key,
        }))
    }

    fn fill(&self, state: &mut State) -> HeartResult<()> {
        let (name, layout, type_key, description) = match self.key.sb_type {
            SmartBlockType::Date => {
                let (y, m, d) = parse_date(&self.key.key)?;
                (
                    format!("{d:02} {} {y}", MONTHS[(m - 1) as usize]),
                    Layout::Date,
                    type_key::DATE,
                    String::new(),
                )
            }
            SmartBlockType::AnytypeProfile => (
                "Anytype".to_string(),
                Layout::Profile,
                type_key::PROFILE,
                "Authored by Anytype".to_string(),
            ),
            _ => (
                "Non-existent object".to_string(),
                Layout::Basic,
                type_key::PAGE,
                String::new(),
            ),
        };
        let title = format!("{}-title", self.id);
        state.add(title_block(&title, &name));
        state.insert_to("", Position::Inner, &[title])?;
        state.set_detail(bundle::NAME, name);
        state.set_detail(bundle::LAYOUT, layout as i64);
        if !description.is_empty() {
            state.set_detail(bundle::DESCRIPTION, description);
        }
        state.set_object_type_keys(vec![type_key.to_string()]);
        Ok(())
    }
}

impl Source for VirtualSource {
    fn id(&self) -> &ObjectId {
        &self.id
    }

    fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    fn sb_type(&self) -> SmartBlockType {
        self.key.sb_type
    }

    fn unique_key(&self) -> Option<&UniqueKey> {
        Some(&self.key)
    }

    fn read_only(&self) -> bool {
        true
    }

    fn read_doc(&self) -> HeartResult<State> {
        let mut state = State::new(
            self.id.clone(),
            self.space_id.clone(),
            self.key.sb_type,
        );
        state.set_unique_key(Some(self.key.clone()));
        self.fill(&mut state)?;
        Ok(state)
    }

    fn push_change(&self, _params: PushChangeParams<'_>) -> HeartResult<ChangeId> {
        Err(HeartError::kind(
            ErrorKind::Restricted,
            format!("{} is read-only", self.id),
        ))
    }

    fn push_store_change(
        &self,
        _changes: Vec<ChangeContent>,
    ) -> HeartResult<ChangeId> {
        Err(HeartError::kind(
            ErrorKind::Restricted,
            format!("{} is read-only", self.id),
        ))
    }

    fn creation_info(&self) -> HeartResult<CreationInfo> {
        Ok(CreationInfo {
            creator: None,
            created: 0,
        })
    }

    fn heads(&self) -> HeartResult<Vec<ChangeId>> {
        Ok(Vec::new())
    }
}
